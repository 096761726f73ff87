//! Background workers: the rate-limited trigger queue and the
//! subscription enforcer.

pub mod enforcer;
pub mod queue;

pub use enforcer::{EnforcerSummary, SubscriptionEnforcer};
pub use queue::{QueueRunSummary, QueueWorker};
