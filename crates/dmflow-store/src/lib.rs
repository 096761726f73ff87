//! SQLite persistence for flows, sessions, the execution log, leads, the
//! trigger queue, and subscription state.

pub mod leads;
pub mod queue;
pub mod store;

pub use queue::{AccountSubscription, Plan};
pub use store::SqliteStore;
