//! In-process broker built on `tokio::sync::broadcast`.
//!
//! One broadcast channel per channel name, created on first subscribe and
//! dropped when its last subscription is released.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::{self, Sender};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{Broker, BrokerError, BrokerSubscription};

type Channels = Mutex<HashMap<String, Sender<Arc<str>>>>;

#[derive(Debug)]
pub struct MemoryBroker {
    channels: Arc<Channels>,
    capacity: usize,
}

fn lock_channels(channels: &Channels) -> MutexGuard<'_, HashMap<String, Sender<Arc<str>>>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `name` if nobody is subscribed to it any more.
fn release_channel(channels: &Weak<Channels>, name: &str) {
    let Some(channels) = channels.upgrade() else {
        return;
    };
    let mut channels = lock_channels(&channels);
    if channels.get(name).is_some_and(|sender| sender.receiver_count() == 0) {
        channels.remove(name);
        tracing::trace!(channel = %name, "Released idle broker channel");
    }
}

impl MemoryBroker {
    /// Create a broker whose channels buffer up to `capacity` messages.
    ///
    /// Subscribers that fall further behind skip the oldest messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Sender<Arc<str>>>> {
        lock_channels(&self.channels)
    }

    /// Number of channels with a live sender.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let mut channels = self.channels();
        let Some(sender) = channels.get(channel) else {
            return Ok(0);
        };
        match sender.send(Arc::from(payload)) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                // Every subscriber has gone away.
                channels.remove(channel);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, channel: &str) -> Result<BrokerSubscription, BrokerError> {
        let receiver = self
            .channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = channel.to_string();
        let messages = BroadcastStream::new(receiver).filter_map(move |item| {
            let name = name.clone();
            async move {
                match item {
                    Ok(payload) => Some(Ok(payload.to_string())),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %name, skipped, "Broker subscriber lagged, messages dropped");
                        None
                    }
                }
            }
        });

        let channels = Arc::downgrade(&self.channels);
        let released = channel.to_string();
        Ok(BrokerSubscription::new(channel, messages.boxed())
            .with_release(move || release_channel(&channels, &released)))
    }
}
