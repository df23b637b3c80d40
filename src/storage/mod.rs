//! Storage capabilities for Tidings.
//!
//! Provides:
//! - Pending queue: per-user FIFO of payloads awaiting delivery
//! - Notification store: durable history and read state
//! - Subscription index: topic -> following users
//! - SQLite and in-memory backends behind the same traits
//!
//! The traits are synchronous; the backing store synchronizes internally.
//! Async callers go through [`run_blocking`].

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, StorageBackend};
use crate::notification::{Notification, QueuedNotification, StoredNotification, UserId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to get pooled connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Blocking store task failed: {0}")]
    Task(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Ordered per-user queue of payloads awaiting delivery.
pub trait PendingQueue: Send + Sync {
    /// Append a payload to the tail of the user's queue, returning its sequence.
    fn append(&self, user: &UserId, payload: &str) -> Result<i64, StoreError>;

    /// Read the user's whole queue in enqueue order without removing anything.
    fn pending(&self, user: &UserId) -> Result<Vec<QueuedNotification>, StoreError>;

    /// Remove every entry of the user's queue with `seq <= through`.
    fn remove_through(&self, user: &UserId, through: i64) -> Result<usize, StoreError>;

    /// Read the queue, then clear exactly the entries that were read.
    ///
    /// Entries appended concurrently with the read stay queued.
    fn drain_all(&self, user: &UserId) -> Result<Vec<String>, StoreError> {
        let entries = self.pending(user)?;
        if let Some(last) = entries.last() {
            self.remove_through(user, last.seq)?;
        }
        Ok(entries.into_iter().map(|e| e.payload).collect())
    }
}

/// Durable notification history.
pub trait NotificationStore: Send + Sync {
    /// Persist a notification. Persisting the same id twice is a no-op.
    fn persist(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Mark a notification as read. Returns false for an unknown id.
    fn mark_read(&self, notification_id: &str) -> Result<bool, StoreError>;

    /// Most recent notifications for a user, newest first.
    fn history(&self, user: &UserId, limit: usize) -> Result<Vec<StoredNotification>, StoreError>;
}

/// Set-valued mapping from topic to following users.
pub trait SubscriptionIndex: Send + Sync {
    /// Add a follower. Returns true if the user was not already following.
    fn subscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError>;

    /// Remove a follower. Returns true if the user was following.
    fn unsubscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError>;

    /// Snapshot of the current followers; may miss a concurrent subscribe.
    fn subscribers(&self, topic: &str) -> Result<Vec<UserId>, StoreError>;
}

/// The three store capabilities the service consumes.
#[derive(Clone)]
pub struct Stores {
    pub pending: Arc<dyn PendingQueue>,
    pub notifications: Arc<dyn NotificationStore>,
    pub subscriptions: Arc<dyn SubscriptionIndex>,
}

impl Stores {
    /// Use one backend for all three capabilities.
    pub fn from_backend<S>(store: S) -> Self
    where
        S: PendingQueue + NotificationStore + SubscriptionIndex + 'static,
    {
        let store = Arc::new(store);
        Self {
            pending: store.clone(),
            notifications: store.clone(),
            subscriptions: store,
        }
    }

    /// Open the backend selected by configuration.
    pub fn open(config: &Config) -> Result<Self, StoreError> {
        match config.storage {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; queued notifications do not survive restart");
                Ok(Self::from_backend(MemoryStore::new()))
            }
            StorageBackend::Sqlite => {
                let path = config.data_dir.join("tidings.db");
                tracing::info!(path = %path.display(), "Opening SQLite storage");
                Ok(Self::from_backend(SqliteStore::open(path, config.pool_size)?))
            }
        }
    }
}

/// Run a synchronous store call on the blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
