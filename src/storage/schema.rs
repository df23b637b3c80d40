//! SQLite schema and connection pragmas.

use rusqlite::Connection;
use std::time::Duration;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_notifications (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_user_seq
    ON pending_notifications (user_id, seq);

CREATE TABLE IF NOT EXISTS notifications (
    id         TEXT    PRIMARY KEY,
    user_id    TEXT    NOT NULL,
    payload    TEXT    NOT NULL,
    created_at INTEGER NOT NULL,
    read_at    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_notifications_user_created
    ON notifications (user_id, created_at);

CREATE TABLE IF NOT EXISTS topic_subscriptions (
    topic   TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (topic, user_id)
);
"#;

/// Database-wide pragmas, applied once when the store is opened.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "SQLite journal mode set");
    apply_connection_pragmas(conn)
}

/// Per-connection pragmas, applied each time the pool hands out a connection.
pub fn apply_connection_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Create tables and indexes if they do not exist.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
