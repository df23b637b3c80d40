//! SQLite-backed store.
//!
//! Uses r2d2 with r2d2_sqlite for pooled access. WAL mode lets the
//! pending-queue appends from producers proceed while sessions replay.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

use super::schema::{apply_connection_pragmas, apply_pragmas, initialize_schema};
use super::{NotificationStore, PendingQueue, StoreError, SubscriptionIndex};
use crate::notification::{Notification, QueuedNotification, StoredNotification, UserId};
use crate::now_millis;

/// Durable store for the pending queue, history and subscription index.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `max_size` - Maximum number of connections in the pool
    pub fn open<P: AsRef<Path>>(db_path: P, max_size: u32) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(db_path);

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(StoreConnectionCustomizer))
            .build(manager)?;

        {
            let conn = pool.get()?;
            apply_pragmas(&conn)?;
            initialize_schema(&conn)?;
        }

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl PendingQueue for SqliteStore {
    fn append(&self, user: &UserId, payload: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_notifications (user_id, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![user.as_str(), payload, now_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn pending(&self, user: &UserId) -> Result<Vec<QueuedNotification>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, payload FROM pending_notifications WHERE user_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![user.as_str()], |row| {
                Ok(QueuedNotification {
                    seq: row.get(0)?,
                    payload: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn remove_through(&self, user: &UserId, through: i64) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM pending_notifications WHERE user_id = ?1 AND seq <= ?2",
            params![user.as_str(), through],
        )?;
        Ok(removed)
    }
}

impl NotificationStore for SqliteStore {
    fn persist(&self, notification: &Notification) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO notifications (id, user_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                notification.id,
                notification.recipient.as_str(),
                notification.payload,
                notification.created_at
            ],
        )?;
        Ok(())
    }

    fn mark_read(&self, notification_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE notifications SET read_at = COALESCE(read_at, ?2) WHERE id = ?1",
            params![notification_id, now_millis()],
        )?;
        Ok(updated == 1)
    }

    fn history(&self, user: &UserId, limit: usize) -> Result<Vec<StoredNotification>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, payload, created_at, read_at IS NOT NULL
             FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user.as_str(), limit as i64], |row| {
                Ok(StoredNotification {
                    notification: Notification {
                        id: row.get(0)?,
                        recipient: UserId::new(row.get::<_, String>(1)?),
                        payload: row.get(2)?,
                        created_at: row.get(3)?,
                    },
                    read: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl SubscriptionIndex for SqliteStore {
    fn subscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO topic_subscriptions (topic, user_id) VALUES (?1, ?2)",
            params![topic, user.as_str()],
        )?;
        Ok(inserted == 1)
    }

    fn unsubscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM topic_subscriptions WHERE topic = ?1 AND user_id = ?2",
            params![topic, user.as_str()],
        )?;
        Ok(removed == 1)
    }

    fn subscribers(&self, topic: &str) -> Result<Vec<UserId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id FROM topic_subscriptions WHERE topic = ?1 ORDER BY user_id ASC",
        )?;
        let rows = stmt
            .query_map(params![topic], |row| row.get::<_, String>(0))?
            .map(|r| r.map(UserId::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Connection customizer that applies per-connection pragmas.
#[derive(Debug)]
struct StoreConnectionCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for StoreConnectionCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_connection_pragmas(conn)
    }
}
