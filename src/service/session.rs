//! Connection sessions.
//!
//! A session owns one client connection end to end. It runs three duties
//! under a shared cancellation token:
//! - Backlog replay: write the pending queue, then remove what was written
//! - Inbound relay: apply client "mark read" frames in arrival order
//! - Outbound relay: forward the user's broker channel to the socket
//!
//! Replay finishing is normal. Any other duty ending cancels the rest, closes
//! the socket and detaches the registry entry. The one exception is a broker
//! failure, which stops only the outbound relay.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionError, ConnectionHandle, FrameSink, FrameStream};
use super::registry::ConnectionRegistry;
use crate::broker::{user_channel, Broker, BrokerError, BrokerSubscription};
use crate::config::SupersedePolicy;
use crate::notification::UserId;
use crate::observability::metrics;
use crate::storage::{run_blocking, NotificationStore, PendingQueue, Stores};

/// Per-session behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Hold live relay until backlog replay has finished.
    pub ordered_replay: bool,
    pub supersede: SupersedePolicy,
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ordered_replay: true,
            supersede: SupersedePolicy::Evict,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a session needs from the service.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub broker: Arc<dyn Broker>,
    pub stores: Stores,
    pub settings: SessionSettings,
    /// Service-wide token; every session runs under a child of it.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy)]
enum Duty {
    Replay,
    Inbound,
    Outbound,
}

/// Run a session for `user` until the connection ends.
///
/// `sink` and `inbound` are the two halves of the client socket.
pub async fn run_session(ctx: SessionContext, user: UserId, sink: FrameSink, inbound: FrameStream) {
    let cancel = ctx.shutdown.child_token();
    let handle = Arc::new(ConnectionHandle::new(
        user.clone(),
        sink,
        cancel.clone(),
        ctx.settings.write_timeout,
    ));

    // Subscribe before replay so live messages published meanwhile are buffered.
    let subscription = ctx.broker.subscribe(&user_channel(&user));

    if let Some(prior) = ctx.registry.attach(&handle) {
        match ctx.settings.supersede {
            SupersedePolicy::Evict => prior.cancel(),
            SupersedePolicy::Keep => tracing::debug!(
                user_id = %user,
                superseded = %prior.id(),
                "Keeping superseded connection open"
            ),
        }
    }

    metrics::record_session_opened();
    tracing::info!(user_id = %user, connection_id = %handle.id(), "Session started");

    let (gate_tx, gate_rx) = oneshot::channel();
    let gate = ctx.settings.ordered_replay.then_some(gate_rx);

    let mut duties = JoinSet::new();
    {
        let handle = handle.clone();
        let pending = ctx.stores.pending.clone();
        duties.spawn(async move {
            let result = replay_backlog(&handle, pending).await;
            let _ = gate_tx.send(());
            (Duty::Replay, result)
        });
    }
    {
        let handle = handle.clone();
        let notifications = ctx.stores.notifications.clone();
        duties.spawn(async move {
            (Duty::Inbound, inbound_relay(&handle, inbound, notifications).await)
        });
    }
    {
        let handle = handle.clone();
        duties.spawn(async move {
            (Duty::Outbound, outbound_relay(&handle, subscription, gate).await)
        });
    }

    while let Some(joined) = duties.join_next().await {
        let (duty, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(user_id = %user, error = %e, "Session duty panicked");
                break;
            }
        };
        match (duty, result) {
            (Duty::Replay, Ok(())) => {}
            (Duty::Outbound, Err(SessionError::Broker(e))) => {
                tracing::warn!(
                    user_id = %user,
                    error = %e,
                    "Live relay stopped; direct deliveries continue"
                );
            }
            (duty, Ok(())) => {
                tracing::debug!(user_id = %user, ?duty, "Session duty finished");
                break;
            }
            (duty, Err(e)) => {
                tracing::info!(user_id = %user, ?duty, error = %e, "Session duty failed");
                break;
            }
        }
    }

    // Teardown: stop the siblings, drop the registry entry, close the socket.
    handle.cancel();
    ctx.registry.detach(&user, &handle);
    handle.close().await;
    while duties.join_next().await.is_some() {}

    metrics::record_session_closed();
    tracing::info!(user_id = %user, connection_id = %handle.id(), "Session ended");
}

/// Replay passes per attach. The follow-up pass picks up entries appended
/// between the first read and the removal of what it wrote.
const REPLAY_PASSES: usize = 2;

/// Write the user's pending queue in order, then remove what was written.
///
/// Entries are removed only after their write succeeded; a failed write
/// leaves it and everything after it queued.
async fn replay_backlog(
    handle: &ConnectionHandle,
    pending: Arc<dyn PendingQueue>,
) -> Result<(), SessionError> {
    for _ in 0..REPLAY_PASSES {
        if replay_pass(handle, &pending).await? == 0 {
            break;
        }
    }
    Ok(())
}

/// One read-write-remove pass over the queue. Returns how many entries were
/// written.
async fn replay_pass(
    handle: &ConnectionHandle,
    pending: &Arc<dyn PendingQueue>,
) -> Result<usize, SessionError> {
    let user = handle.user().clone();

    let entries = {
        let pending = pending.clone();
        let user = user.clone();
        run_blocking(move || pending.pending(&user)).await
    };
    let entries = match entries {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(user_id = %user, error = %e, "Failed to read pending queue; left for next attach");
            return Ok(0);
        }
    };
    if entries.is_empty() {
        return Ok(0);
    }

    let mut written = 0_usize;
    let mut last_seq = None;
    let mut failure = None;
    for entry in &entries {
        if let Err(e) = handle.send(&entry.payload).await {
            failure = Some(e);
            break;
        }
        written += 1;
        last_seq = Some(entry.seq);
    }

    if let Some(through) = last_seq {
        let removed = {
            let pending = pending.clone();
            let user = user.clone();
            run_blocking(move || pending.remove_through(&user, through)).await
        };
        if let Err(e) = removed {
            tracing::warn!(
                user_id = %user,
                error = %e,
                "Failed to clear replayed entries; they will be delivered again"
            );
        }
        metrics::record_backlog_replayed(written as u64);
        tracing::debug!(user_id = %user, replayed = written, queued = entries.len(), "Backlog replayed");
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(written),
    }
}

/// Apply client frames until the client closes or the session is cancelled.
async fn inbound_relay(
    handle: &ConnectionHandle,
    mut inbound: FrameStream,
    notifications: Arc<dyn NotificationStore>,
) -> Result<(), SessionError> {
    let cancel = handle.cancellation().clone();
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = inbound.next() => frame,
        };
        match frame {
            Some(Ok(text)) => handle_client_frame(handle.user(), &notifications, &text).await,
            Some(Err(e)) => return Err(e.into()),
            None => {
                tracing::debug!(user_id = %handle.user(), "Client closed connection");
                return Ok(());
            }
        }
    }
}

/// A client frame is the id of a notification to mark read.
async fn handle_client_frame(user: &UserId, notifications: &Arc<dyn NotificationStore>, text: &str) {
    let id = text.trim();
    if id.is_empty() {
        return;
    }

    let store = notifications.clone();
    let notification_id = id.to_string();
    match run_blocking(move || store.mark_read(&notification_id)).await {
        Ok(true) => tracing::debug!(user_id = %user, notification_id = id, "Notification marked read"),
        Ok(false) => tracing::debug!(user_id = %user, notification_id = id, "Unknown notification id"),
        Err(e) => tracing::warn!(user_id = %user, notification_id = id, error = %e, "Failed to mark notification read"),
    }
}

/// Forward broker messages to the socket, after `gate` opens if present.
async fn outbound_relay(
    handle: &ConnectionHandle,
    subscription: Result<BrokerSubscription, BrokerError>,
    gate: Option<oneshot::Receiver<()>>,
) -> Result<(), SessionError> {
    let mut subscription = subscription?;
    let cancel = handle.cancellation().clone();

    if let Some(gate) = gate {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = gate => {}
        }
    }

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            message = subscription.recv() => message?,
        };
        handle.send(&message).await?;
    }
}
