//! Tidings: a real-time notification delivery service.
//!
//! Tidings keeps a registry of connected users, bridges a per-user
//! publish/subscribe channel to each user's live WebSocket, and queues
//! notifications produced while a user is offline so they are replayed on
//! reconnect. Topic fan-out notifies every follower of a topic.
//!
//! # Architecture
//!
//! - **Registry**: one live connection per user, weakly referenced
//! - **Sessions**: replay, inbound and outbound duties under one cancellation token
//! - **Dispatcher**: online write or offline enqueue, always persisted
//! - **Fan-out**: per-topic delivery, on demand or on a fixed cycle
//!
//! # Modules
//!
//! - [`broker`]: Per-user publish/subscribe channels
//! - [`config`]: CLI and environment configuration
//! - [`notification`]: Core identifiers and records
//! - [`observability`]: Metrics and tracing setup
//! - [`server`]: HTTP server setup and lifecycle
//! - [`service`]: Registry, sessions, dispatch, fan-out and routes
//! - [`storage`]: Pending queue, durable history and subscription index

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::StoreError is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::similar_names,              // seq/seqs are fine
    clippy::struct_excessive_bools,     // Config structs may have flags
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod broker;
pub mod config;
pub mod notification;
pub mod observability;
pub mod server;
pub mod service;
pub mod storage;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) notification ID.
///
/// # Example
///
/// ```
/// let id = tidings::generate_notification_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_notification_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
