//! Test utilities and service harness for Tidings tests.
//!
//! Provides:
//! - In-process service state over memory or SQLite storage
//! - In-memory socket pairs driving real sessions
//! - Test database fixtures

#![allow(dead_code)]

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidings::config::Config;
use tidings::notification::UserId;
use tidings::server::ServerState;
use tidings::service::{run_session, ConnectionError, FanOutDriver, FrameSink, FrameStream};
use tidings::storage::{MemoryStore, SqliteStore, Stores};
use tokio::task::JoinHandle;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("tidings.db");
        Self { temp_dir, db_path }
    }

    pub fn config(&self) -> Config {
        Config::test_config(self.temp_dir.path().to_path_buf())
    }

    /// Open a SQLite-backed store bundle on the fixture database.
    pub fn sqlite_stores(&self) -> Stores {
        Stores::from_backend(SqliteStore::open(&self.db_path, 2).expect("failed to open sqlite store"))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-process service: shared state plus its fan-out driver.
pub struct TestService {
    pub state: Arc<ServerState>,
    pub driver: FanOutDriver,
}

impl TestService {
    /// Service over in-memory storage with test defaults.
    pub fn memory() -> Self {
        let fixture_dir = std::env::temp_dir();
        Self::with_stores(&Config::test_config(fixture_dir), Stores::from_backend(MemoryStore::new()))
    }

    pub fn with_stores(config: &Config, stores: Stores) -> Self {
        tidings::observability::tracing::init_test_tracing();
        let (state, driver) = ServerState::new(config, stores);
        Self { state, driver }
    }

    /// Open a session for `user` over an in-memory socket and wait until it
    /// is the user's registered connection.
    pub async fn connect(&self, user: &str) -> TestClient {
        let user = UserId::from(user);
        let previous = self.state.registry.lookup(&user).map(|h| h.id());

        let (out_tx, out_rx) = mpsc::unbounded();
        let (in_tx, in_rx) = mpsc::unbounded();
        let sink: FrameSink = Box::pin(out_tx.sink_map_err(|_| ConnectionError::Closed));
        let stream: FrameStream = Box::pin(in_rx);

        let session = tokio::spawn(run_session(
            self.state.session_context(),
            user.clone(),
            sink,
            stream,
        ));

        let registry = self.state.registry.clone();
        let attached = wait_for(Duration::from_secs(2), || {
            registry
                .lookup(&user)
                .is_some_and(|h| Some(h.id()) != previous)
        })
        .await;
        assert!(attached, "session for {user} did not attach");

        TestClient {
            to_server: Some(in_tx),
            from_server: out_rx,
            session,
        }
    }
}

/// Client side of an in-memory socket.
pub struct TestClient {
    to_server: Option<mpsc::UnboundedSender<Result<String, ConnectionError>>>,
    from_server: mpsc::UnboundedReceiver<String>,
    session: JoinHandle<()>,
}

impl TestClient {
    /// Next frame from the server, or `None` if nothing arrives in time or
    /// the socket was closed.
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.from_server.next())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the server to close this socket.
    pub async fn closed_by_server(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.from_server.next()).await {
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(_) => return false,
            }
        }
    }

    /// Send a text frame to the server.
    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.to_server {
            tx.unbounded_send(Ok(text.to_string()))
                .expect("session stopped reading");
        }
    }

    /// Close the client side and wait for the session to finish.
    pub async fn disconnect(mut self) {
        self.to_server.take();
        tokio::time::timeout(Duration::from_secs(2), self.session)
            .await
            .expect("session did not end after disconnect")
            .expect("session panicked");
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Arguments
///
/// * `timeout` - Maximum time to wait
/// * `condition` - Closure that returns true when condition is met
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
