//! deskhub-api: presence and login API for the DeskHub remote-desktop server
//!
//! Peers report heartbeats that are kept in a write-behind cache and written
//! to SQLite in batches. Password logins are guarded by a per-IP failure
//! limiter.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod flush;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod server;
pub mod store;

#[cfg(test)]
mod limiter_props;

pub use config::ServerConfig;
pub use server::DeskHubServer;
