//! Publish/subscribe bridge to per-user live channels.
//!
//! Each user has one channel, named by [`user_channel`]. Producers other than
//! the dispatcher publish on it to push live updates; a user's session
//! subscribes and relays every message to the socket. The broker keeps no
//! history: a message published while nobody listens is gone.

pub mod memory;

use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

use crate::notification::UserId;

pub use memory::MemoryBroker;

/// Error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker channel '{0}' closed")]
    Closed(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Deterministic channel name for a user's live notifications.
pub fn user_channel(user: &UserId) -> String {
    format!("user:{user}:notifications")
}

/// A publish/subscribe broker with per-name channels.
pub trait Broker: Send + Sync {
    /// Publish a payload, returning how many subscribers received it.
    ///
    /// Zero subscribers is not an error.
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Subscribe to every message published on `channel` from now on.
    fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError>;
}

/// Runs once when a subscription is dropped, after its receiver is gone.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// An active subscription to one broker channel.
pub struct BrokerSubscription {
    channel: String,
    messages: BoxStream<'static, Result<String, BrokerError>>,
    on_release: Option<ReleaseHook>,
}

impl BrokerSubscription {
    pub fn new(
        channel: impl Into<String>,
        messages: BoxStream<'static, Result<String, BrokerError>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            messages,
            on_release: None,
        }
    }

    /// Attach a hook that runs when the subscription is dropped.
    #[must_use]
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message on the channel.
    pub async fn recv(&mut self) -> Result<String, BrokerError> {
        match self.messages.next().await {
            Some(message) => message,
            None => Err(BrokerError::Closed(self.channel.clone())),
        }
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            // Drop the receiver first so the hook sees it gone.
            self.messages = futures::stream::empty().boxed();
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_user_channel_name() {
        assert_eq!(user_channel(&UserId::from("42")), "user:42:notifications");
    }

    #[tokio::test]
    async fn test_exhausted_subscription_reports_closed() {
        let mut sub = BrokerSubscription::new("c", futures::stream::empty().boxed());
        assert!(matches!(sub.recv().await, Err(BrokerError::Closed(c)) if c == "c"));
    }

    #[test]
    fn test_release_hook_runs_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let sub = BrokerSubscription::new("c", futures::stream::empty().boxed())
            .with_release(move || flag.store(true, Ordering::SeqCst));

        assert!(!released.load(Ordering::SeqCst));
        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }
}
