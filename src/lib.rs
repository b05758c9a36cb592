//! # orgboard
//!
//! A multi-tenant organizational task tracker with a real-time chat channel
//! per tenant.
//!
//! Many independent organizations share one deployment; each tenant's users,
//! tasks, and chat traffic are invisible to every other tenant.
//!
//! ## Architecture
//!
//! ```text
//!   client ── /api/login ──▶ Claims (JWT)
//!      │
//!      ├── /api/tasks/* ──▶ lifecycle ──▶ store (SQLite)
//!      │                    pending → done → approved
//!      │
//!      └── /api/chat/ws ──▶ HubRegistry ──▶ ChatHub (one actor per tenant)
//! ```
//!
//! ## Modules
//! - `lifecycle`: the task state machine and its authorization policy
//! - `hub`: per-tenant broadcast hubs and the hub registry
//! - `store`: SQLite persistence for tenants, users, and tasks
//! - `api`: axum routes, JWT auth, and the WebSocket chat endpoint

pub mod api;
pub mod config;
pub mod hub;
pub mod lifecycle;
pub mod store;
pub mod tenant;

pub use config::Config;
