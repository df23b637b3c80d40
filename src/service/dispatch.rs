//! Notification dispatcher.
//!
//! The single entry point producers use to notify a user. An online user
//! gets a direct socket write; an offline user gets a pending-queue append.
//! Either way the notification is persisted to history, and a persistence
//! failure never fails the delivery.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::connection::ConnectionError;
use super::registry::ConnectionRegistry;
use crate::notification::{Notification, UserId};
use crate::observability::metrics;
use crate::storage::{run_blocking, StoreError, Stores};

/// Where a dispatched notification went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Written to the user's live connection
    Delivered,
    /// Appended to the user's pending queue
    Queued,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub notification_id: String,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The user was online but the write failed. The session tears down, so
    /// later deliveries take the offline path.
    #[error("Write to live connection failed: {0}")]
    Write(#[source] ConnectionError),

    #[error("Pending queue append failed: {0}")]
    Enqueue(#[source] StoreError),
}

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    stores: Stores,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, stores: Stores) -> Self {
        Self { registry, stores }
    }

    /// Deliver `payload` to `user`.
    ///
    /// Exactly one of {socket write, queue append} is attempted, plus one
    /// history write. A write failure does not fall back to the queue.
    #[tracing::instrument(skip(self, user, payload), fields(user_id = %user, notification_id))]
    pub async fn deliver(&self, user: &UserId, payload: &str) -> Result<Delivery, DeliveryError> {
        let notification = Notification::new(user.clone(), payload);
        tracing::Span::current().record("notification_id", notification.id.as_str());

        let (routed, ()) = tokio::join!(self.route(&notification), self.persist(&notification));

        match routed {
            Ok(outcome) => {
                metrics::record_delivery(outcome.as_str());
                tracing::debug!(outcome = outcome.as_str(), "Notification dispatched");
                Ok(Delivery {
                    notification_id: notification.id,
                    outcome,
                })
            }
            Err(e) => {
                metrics::record_delivery("failed");
                tracing::warn!(error = %e, "Notification dispatch failed");
                Err(e)
            }
        }
    }

    async fn route(&self, notification: &Notification) -> Result<DeliveryOutcome, DeliveryError> {
        if let Some(handle) = self.registry.lookup(&notification.recipient) {
            handle
                .send(&notification.payload)
                .await
                .map_err(DeliveryError::Write)?;
            return Ok(DeliveryOutcome::Delivered);
        }

        let pending = self.stores.pending.clone();
        let user = notification.recipient.clone();
        let payload = notification.payload.clone();
        run_blocking(move || pending.append(&user, &payload))
            .await
            .map_err(DeliveryError::Enqueue)?;
        Ok(DeliveryOutcome::Queued)
    }

    async fn persist(&self, notification: &Notification) {
        let store = self.stores.notifications.clone();
        let record = notification.clone();
        if let Err(e) = run_blocking(move || store.persist(&record)).await {
            metrics::record_persist_failure();
            tracing::warn!(error = %e, "Failed to persist notification history");
        }
    }
}
