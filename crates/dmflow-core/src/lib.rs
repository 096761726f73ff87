pub mod config;
pub mod error;
pub mod payload;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{DmFlowError, Result};
pub use payload::{PayloadKind, ResponsePayload};
pub use types::*;
