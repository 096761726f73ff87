//! HTTP client for the outbound Messaging Gateway.

pub mod client;

pub use client::GraphClient;
