//! Live connection handle.
//!
//! A [`ConnectionHandle`] wraps the outbound half of one client socket. The
//! session that accepted the socket owns the handle; everyone else (the
//! registry, the dispatcher) reaches it through a weak reference. Writes lock
//! only this connection's sink, never a shared structure.

use futures::{Sink, SinkExt, Stream};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::notification::UserId;

/// Outbound text frames to a client.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;

/// Inbound text frames from a client. The stream ends when the client closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Error type for socket operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    sink: Mutex<FrameSink>,
    sink_closed: AtomicBool,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl ConnectionHandle {
    /// Wrap a client sink.
    ///
    /// Cancelling `cancel` fails in-flight and future writes and tells the
    /// owning session to tear down.
    pub fn new(
        user: UserId,
        sink: FrameSink,
        cancel: CancellationToken,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            user,
            sink: Mutex::new(sink),
            sink_closed: AtomicBool::new(false),
            cancel,
            write_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the connection has been cancelled or has failed a write.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the owning session to tear down without touching the socket.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Write one text frame.
    ///
    /// Any failure cancels the connection so the owning session tears down.
    pub async fn send(&self, text: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(ConnectionError::Closed),
            result = self.write(text) => result,
        };

        if let Err(e) = &result {
            if !matches!(e, ConnectionError::Closed) {
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = %self.user,
                    error = %e,
                    "Socket write failed"
                );
            }
            self.cancel.cancel();
        }
        result
    }

    async fn write(&self, text: &str) -> Result<(), ConnectionError> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.send(text.to_string())).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.write_timeout)),
        }
    }

    /// Cancel the connection and close the socket. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        if self.sink_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(connection_id = %self.id, error = %e, "Socket close failed");
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
