//! HTTP surface: the platform webhook endpoints and the internal
//! trigger-processing endpoint.

pub mod events;
pub mod routes;
pub mod server;
pub mod state;

pub use server::FlowServer;
pub use state::AppState;
