//! In-process store.
//!
//! Backs `--storage memory` and the test suites. Nothing survives a restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use super::{NotificationStore, PendingQueue, StoreError, SubscriptionIndex};
use crate::notification::{Notification, QueuedNotification, StoredNotification, UserId};

#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<UserId, VecDeque<QueuedNotification>>>,
    next_seq: AtomicI64,
    notifications: Mutex<HashMap<String, StoredNotification>>,
    topics: RwLock<HashMap<String, HashSet<UserId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex.lock().map_err(|_| StoreError::Poisoned)
}

impl PendingQueue for MemoryStore {
    fn append(&self, user: &UserId, payload: &str) -> Result<i64, StoreError> {
        let mut queues = lock(&self.queues)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        queues
            .entry(user.clone())
            .or_default()
            .push_back(QueuedNotification {
                seq,
                payload: payload.to_string(),
            });
        Ok(seq)
    }

    fn pending(&self, user: &UserId) -> Result<Vec<QueuedNotification>, StoreError> {
        let queues = lock(&self.queues)?;
        Ok(queues
            .get(user)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_through(&self, user: &UserId, through: i64) -> Result<usize, StoreError> {
        let mut queues = lock(&self.queues)?;
        let Some(queue) = queues.get_mut(user) else {
            return Ok(0);
        };
        let before = queue.len();
        while queue.front().is_some_and(|e| e.seq <= through) {
            queue.pop_front();
        }
        let removed = before - queue.len();
        if queue.is_empty() {
            queues.remove(user);
        }
        Ok(removed)
    }
}

impl NotificationStore for MemoryStore {
    fn persist(&self, notification: &Notification) -> Result<(), StoreError> {
        lock(&self.notifications)?
            .entry(notification.id.clone())
            .or_insert_with(|| StoredNotification {
                notification: notification.clone(),
                read: false,
            });
        Ok(())
    }

    fn mark_read(&self, notification_id: &str) -> Result<bool, StoreError> {
        let mut notifications = lock(&self.notifications)?;
        Ok(match notifications.get_mut(notification_id) {
            Some(stored) => {
                stored.read = true;
                true
            }
            None => false,
        })
    }

    fn history(&self, user: &UserId, limit: usize) -> Result<Vec<StoredNotification>, StoreError> {
        let notifications = lock(&self.notifications)?;
        let mut history: Vec<StoredNotification> = notifications
            .values()
            .filter(|s| &s.notification.recipient == user)
            .cloned()
            .collect();
        history.sort_by(|a, b| {
            (b.notification.created_at, &b.notification.id)
                .cmp(&(a.notification.created_at, &a.notification.id))
        });
        history.truncate(limit);
        Ok(history)
    }
}

impl SubscriptionIndex for MemoryStore {
    fn subscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError> {
        let mut topics = self.topics.write().map_err(|_| StoreError::Poisoned)?;
        Ok(topics.entry(topic.to_string()).or_default().insert(user.clone()))
    }

    fn unsubscribe(&self, topic: &str, user: &UserId) -> Result<bool, StoreError> {
        let mut topics = self.topics.write().map_err(|_| StoreError::Poisoned)?;
        let Some(followers) = topics.get_mut(topic) else {
            return Ok(false);
        };
        let removed = followers.remove(user);
        if followers.is_empty() {
            topics.remove(topic);
        }
        Ok(removed)
    }

    fn subscribers(&self, topic: &str) -> Result<Vec<UserId>, StoreError> {
        let topics = self.topics.read().map_err(|_| StoreError::Poisoned)?;
        let mut followers: Vec<UserId> = topics
            .get(topic)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        followers.sort();
        Ok(followers)
    }
}
