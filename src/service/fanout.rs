//! Topic fan-out.
//!
//! A topic event notifies every user following the topic through the
//! dispatcher, so online followers get a socket write and offline followers
//! get a queued entry. [`FanOut::notify_topic`] runs one fan-out on demand;
//! [`FanOutDriver`] batches events from producers and fans them out on a
//! fixed cycle.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::dispatch::{DeliveryOutcome, Dispatcher};
use crate::observability::metrics;
use crate::storage::{run_blocking, SubscriptionIndex};

/// Result of fanning one message out to a topic's followers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub topic: String,
    pub recipients: usize,
    pub delivered: usize,
    pub queued: usize,
    pub failed: usize,
}

pub struct FanOut {
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<dyn SubscriptionIndex>,
    prefix: String,
}

impl FanOut {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        subscriptions: Arc<dyn SubscriptionIndex>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            subscriptions,
            prefix: prefix.into(),
        }
    }

    /// Dispatch `message` to every current follower of `topic`, one at a time.
    ///
    /// A failed dispatch is counted and skipped. If the follower list cannot
    /// be read the report is empty.
    #[tracing::instrument(skip(self, topic, message), fields(topic = %topic))]
    pub async fn notify_topic(&self, topic: &str, message: &str) -> FanOutReport {
        let mut report = FanOutReport {
            topic: topic.to_string(),
            ..FanOutReport::default()
        };

        let subscribers = {
            let index = self.subscriptions.clone();
            let topic = topic.to_string();
            run_blocking(move || index.subscribers(&topic)).await
        };
        let subscribers = match subscribers {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read topic followers; skipping fan-out");
                return report;
            }
        };

        report.recipients = subscribers.len();
        let payload = format!("{}{}", self.prefix, message);
        for user in &subscribers {
            match self.dispatcher.deliver(user, &payload).await {
                Ok(delivery) => match delivery.outcome {
                    DeliveryOutcome::Delivered => report.delivered += 1,
                    DeliveryOutcome::Queued => report.queued += 1,
                },
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(user_id = %user, error = %e, "Fan-out dispatch failed");
                }
            }
        }

        metrics::record_fanout(topic, report.recipients as u64);
        tracing::debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            queued = report.queued,
            failed = report.failed,
            "Topic fan-out complete"
        );
        report
    }
}

/// A fan-out request from a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEvent {
    pub topic: String,
    pub message: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventQueueError {
    #[error("Topic event queue is full")]
    Full,

    #[error("Fan-out driver has stopped")]
    Stopped,
}

/// Producer side of the fan-out driver's event queue.
#[derive(Debug, Clone)]
pub struct TopicEventSender {
    tx: mpsc::Sender<TopicEvent>,
}

impl TopicEventSender {
    /// Queue an event for the next cycle without waiting.
    pub fn try_send(&self, event: TopicEvent) -> Result<(), EventQueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EventQueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EventQueueError::Stopped,
        })
    }
}

/// Fans out queued topic events on a fixed cycle.
pub struct FanOutDriver {
    fanout: Arc<FanOut>,
    interval: Duration,
    rx: mpsc::Receiver<TopicEvent>,
    batch_limit: usize,
}

impl FanOutDriver {
    /// Create a driver and the sender producers use to feed it.
    ///
    /// `capacity` bounds how many events may wait between cycles.
    pub fn new(fanout: Arc<FanOut>, interval: Duration, capacity: usize) -> (Self, TopicEventSender) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let driver = Self {
            fanout,
            interval,
            rx,
            batch_limit: capacity,
        };
        (driver, TopicEventSender { tx })
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(interval = ?self.interval, "Fan-out driver started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
            self.run_cycle().await;
        }
        tracing::info!("Fan-out driver stopped");
    }

    /// Fan out every event queued since the previous cycle, in arrival order.
    ///
    /// Events arriving during the cycle wait for the next one.
    pub async fn run_cycle(&mut self) -> Vec<FanOutReport> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_limit {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        let mut reports = Vec::with_capacity(batch.len());
        for event in batch {
            reports.push(self.fanout.notify_topic(&event.topic, &event.message).await);
        }
        if !reports.is_empty() {
            tracing::debug!(events = reports.len(), "Fan-out cycle complete");
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::UserId;
    use crate::service::connection::{ConnectionError, ConnectionHandle, FrameSink};
    use crate::service::registry::ConnectionRegistry;
    use crate::storage::{MemoryStore, NotificationStore, PendingQueue, StoreError, Stores};
    use futures::channel::mpsc as channel;
    use futures::{SinkExt, StreamExt};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        stores: Stores,
        fanout: Arc<FanOut>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let stores = Stores::from_backend(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), stores.clone()));
        let fanout = Arc::new(FanOut::new(
            dispatcher,
            stores.subscriptions.clone(),
            "Market Update: ",
        ));
        Harness {
            registry,
            stores,
            fanout,
        }
    }

    fn connect(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (Arc<ConnectionHandle>, channel::UnboundedReceiver<String>) {
        let (tx, rx) = channel::unbounded();
        let sink: FrameSink = Box::pin(tx.sink_map_err(|_| ConnectionError::Closed));
        let handle = Arc::new(ConnectionHandle::new(
            UserId::from(user),
            sink,
            CancellationToken::new(),
            Duration::from_secs(1),
        ));
        registry.attach(&handle);
        (handle, rx)
    }

    #[tokio::test]
    async fn test_mixed_online_offline_followers() {
        let h = harness();
        for user in ["u1", "u2", "u3"] {
            h.stores.subscriptions.subscribe("AAPL", &UserId::from(user)).unwrap();
        }
        let (_h1, mut rx1) = connect(&h.registry, "u1");
        let (_h2, mut rx2) = connect(&h.registry, "u2");

        let report = h.fanout.notify_topic("AAPL", "up 3%").await;
        assert_eq!(report.recipients, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.queued, 1);
        assert_eq!(report.failed, 0);

        assert_eq!(rx1.next().await.unwrap(), "Market Update: up 3%");
        assert_eq!(rx2.next().await.unwrap(), "Market Update: up 3%");
        let queued = h.stores.pending.pending(&UserId::from("u3")).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].payload, "Market Update: up 3%");
    }

    #[tokio::test]
    async fn test_topic_without_followers_is_empty() {
        let h = harness();
        let report = h.fanout.notify_topic("MSFT", "flat").await;
        assert_eq!(
            report,
            FanOutReport {
                topic: "MSFT".into(),
                ..FanOutReport::default()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_follower_does_not_stop_the_rest() {
        let h = harness();
        for user in ["u1", "u2"] {
            h.stores.subscriptions.subscribe("AAPL", &UserId::from(user)).unwrap();
        }
        let (_h1, rx1) = connect(&h.registry, "u1");
        drop(rx1);

        let report = h.fanout.notify_topic("AAPL", "news").await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(h.stores.notifications.history(&UserId::from("u2"), 10).unwrap().len(), 1);
    }

    struct BrokenIndex;

    impl SubscriptionIndex for BrokenIndex {
        fn subscribe(&self, _: &str, _: &UserId) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn unsubscribe(&self, _: &str, _: &UserId) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn subscribers(&self, _: &str) -> Result<Vec<UserId>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_unreadable_index_yields_empty_report() {
        let h = harness();
        let fanout = FanOut::new(
            Arc::new(Dispatcher::new(h.registry.clone(), h.stores.clone())),
            Arc::new(BrokenIndex),
            "",
        );
        let report = fanout.notify_topic("AAPL", "news").await;
        assert_eq!(report.recipients, 0);
    }

    #[tokio::test]
    async fn test_cycle_drains_events_in_order() {
        let h = harness();
        let user = UserId::from("u1");
        h.stores.subscriptions.subscribe("AAPL", &user).unwrap();
        h.stores.subscriptions.subscribe("GOOG", &user).unwrap();

        let (mut driver, sender) = FanOutDriver::new(h.fanout.clone(), Duration::from_secs(60), 8);
        for (topic, message) in [("AAPL", "one"), ("GOOG", "two"), ("AAPL", "three")] {
            sender
                .try_send(TopicEvent {
                    topic: topic.into(),
                    message: message.into(),
                })
                .unwrap();
        }

        let reports = driver.run_cycle().await;
        let topics: Vec<&str> = reports.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, vec!["AAPL", "GOOG", "AAPL"]);

        let payloads: Vec<String> = h
            .stores
            .pending
            .pending(&user)
            .unwrap()
            .into_iter()
            .map(|q| q.payload)
            .collect();
        assert_eq!(
            payloads,
            vec!["Market Update: one", "Market Update: two", "Market Update: three"]
        );

        assert!(driver.run_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_events() {
        let h = harness();
        let (_driver, sender) = FanOutDriver::new(h.fanout.clone(), Duration::from_secs(60), 1);
        let event = TopicEvent {
            topic: "AAPL".into(),
            message: "x".into(),
        };
        sender.try_send(event.clone()).unwrap();
        assert_eq!(sender.try_send(event), Err(EventQueueError::Full));
    }

    #[tokio::test]
    async fn test_stopped_driver_rejects_events() {
        let h = harness();
        let (driver, sender) = FanOutDriver::new(h.fanout.clone(), Duration::from_secs(60), 4);
        drop(driver);
        let event = TopicEvent {
            topic: "AAPL".into(),
            message: "x".into(),
        };
        assert_eq!(sender.try_send(event), Err(EventQueueError::Stopped));
    }

    #[tokio::test]
    async fn test_driver_runs_cycles_until_cancelled() {
        let h = harness();
        let user = UserId::from("u1");
        h.stores.subscriptions.subscribe("AAPL", &user).unwrap();

        let (driver, sender) = FanOutDriver::new(h.fanout.clone(), Duration::from_millis(20), 8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(cancel.clone()));

        sender
            .try_send(TopicEvent {
                topic: "AAPL".into(),
                message: "news".into(),
            })
            .unwrap();

        let pending = h.stores.pending.clone();
        let mut delivered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if pending.pending(&user).unwrap().len() == 1 {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "event should be fanned out within a cycle");

        cancel.cancel();
        task.await.unwrap();
    }
}
