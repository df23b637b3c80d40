//! Core identifiers and notification records.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{generate_notification_id, now_millis};

/// Opaque user identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A notification addressed to one user. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub recipient: UserId,
    pub payload: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Notification {
    /// Create a notification stamped with a fresh UUIDv7 and the current time.
    pub fn new(recipient: UserId, payload: impl Into<String>) -> Self {
        Self {
            id: generate_notification_id(),
            recipient,
            payload: payload.into(),
            created_at: now_millis(),
        }
    }
}

/// One entry of a user's pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedNotification {
    /// Store-assigned position; increases with enqueue order.
    pub seq: i64,
    pub payload: String,
}

/// A persisted notification together with its read state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredNotification {
    #[serde(flatten)]
    pub notification: Notification,
    pub read: bool,
}
