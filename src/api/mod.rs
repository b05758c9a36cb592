//! HTTP API surface.

pub mod auth;
pub mod chat;
pub mod routes;
pub mod types;

pub use routes::{serve, AppState};
