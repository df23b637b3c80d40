//! Connection registry: one live connection per user.
//!
//! The registry maps each user to their current [`ConnectionHandle`] through
//! a `Weak` reference. It never owns or closes a socket on replacement; the
//! session that accepted the socket does. The lock covers map access only and
//! is never held across socket I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::connection::ConnectionHandle;
use crate::notification::UserId;

/// Registry tracking each user's active connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Map of active connections: user -> non-owning handle
    active: Mutex<HashMap<UserId, Weak<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<UserId, Weak<ConnectionHandle>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` as its user's connection, replacing any prior entry.
    ///
    /// Returns the superseded handle if it is still alive. The caller decides
    /// what happens to it; the registry does not close it.
    pub fn attach(&self, handle: &Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let previous = self
            .active()
            .insert(handle.user().clone(), Arc::downgrade(handle));

        let previous = previous
            .and_then(|weak| weak.upgrade())
            .filter(|prior| !Arc::ptr_eq(prior, handle));

        if let Some(prior) = &previous {
            tracing::info!(
                user_id = %handle.user(),
                connection_id = %handle.id(),
                superseded = %prior.id(),
                "Connection superseded by newer attach"
            );
        }
        previous
    }

    /// Current live connection for `user`, if any.
    ///
    /// Connections already torn down or cancelled read as absent.
    pub fn lookup(&self, user: &UserId) -> Option<Arc<ConnectionHandle>> {
        let weak = self.active().get(user).cloned()?;
        weak.upgrade().filter(|handle| !handle.is_closed())
    }

    /// Remove `user`'s entry only if it still points at `handle`.
    ///
    /// A session tearing down after being superseded leaves the newer entry
    /// in place. Returns true if the entry was removed.
    pub fn detach(&self, user: &UserId, handle: &Arc<ConnectionHandle>) -> bool {
        let mut active = self.active();
        let is_current = active
            .get(user)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(handle)));
        if is_current {
            active.remove(user);
        }
        is_current
    }

    /// Close every live connection. Used at service stop.
    ///
    /// Returns the number of connections closed.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .active()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();

        for handle in &handles {
            handle.close().await;
        }
        handles.len()
    }

    /// Get the number of live connections.
    pub fn active_count(&self) -> usize {
        self.active()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
