//! Live subscriptions of one downstream connection.
//!
//! Entries are keyed by `(connection, subscription id, upstream)`. A single
//! client `subscribe` creates one entry per upstream, so cancelling by id
//! is a range scan over the ordered map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::cancel::CancelHandle;
use crate::websocket::connection::ConnectionId;

/// Identifies one upstream leg of one client subscription.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    /// Owning downstream connection.
    pub connection: ConnectionId,
    /// Client-chosen operation id.
    pub subscription: String,
    /// Upstream name.
    pub upstream: String,
}

/// Proof of one registration, used to release exactly that entry.
///
/// A later registration under the same key gets a different serial, so a
/// stale forwarder finishing late cannot remove its successor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    /// The registered key.
    pub key: SubscriptionKey,
    serial: u64,
}

struct Entry {
    serial: u64,
    handle: CancelHandle,
}

/// Maps live subscription legs to their cancellation handles.
pub struct SubscriptionTracker {
    connection: ConnectionId,
    entries: Mutex<BTreeMap<SubscriptionKey, Entry>>,
    next_serial: AtomicU64,
}

impl SubscriptionTracker {
    /// Empty tracker for one connection.
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            entries: Mutex::new(BTreeMap::new()),
            next_serial: AtomicU64::new(0),
        }
    }

    /// The connection this tracker belongs to.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    fn key(&self, subscription: &str, upstream: &str) -> SubscriptionKey {
        SubscriptionKey {
            connection: self.connection,
            subscription: subscription.to_owned(),
            upstream: upstream.to_owned(),
        }
    }

    /// Record a live leg.
    ///
    /// If the exact key is already present the previous handle is cancelled
    /// so it cannot leak.
    pub fn register(&self, subscription: &str, upstream: &str, handle: CancelHandle) -> Registration {
        let key = self.key(subscription, upstream);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .entries
            .lock()
            .insert(key.clone(), Entry { serial, handle });

        if let Some(old) = replaced {
            debug!(subscription, upstream, "replacing live subscription leg");
            let _ = old.handle.cancel();
        }
        Registration { key, serial }
    }

    /// Cancel and remove every leg of `subscription`.
    ///
    /// Returns how many legs were cancelled. Unknown ids are a no-op.
    pub fn cancel_by_id(&self, subscription: &str) -> usize {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<SubscriptionKey> = entries
                .range(self.key(subscription, "")..)
                .take_while(|(k, _)| k.subscription == subscription)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        for entry in &removed {
            let _ = entry.handle.cancel();
        }
        removed.len()
    }

    /// Cancel and remove every leg of this connection.
    pub fn cancel_all(&self) -> usize {
        let removed = std::mem::take(&mut *self.entries.lock());
        for entry in removed.values() {
            let _ = entry.handle.cancel();
        }
        removed.len()
    }

    /// Forget a leg that ended on its own, without cancelling it.
    ///
    /// Only removes the entry if it is still the one `registration` created.
    pub fn release(&self, registration: &Registration) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&registration.key) {
            Some(entry) if entry.serial == registration.serial => {
                let _ = entries.remove(&registration.key);
                true
            }
            _ => false,
        }
    }

    /// Whether any leg of `subscription` is live.
    pub fn contains_id(&self, subscription: &str) -> bool {
        self.entries
            .lock()
            .range(self.key(subscription, "")..)
            .next()
            .is_some_and(|(k, _)| k.subscription == subscription)
    }

    /// Upstream names with a live leg for `subscription`.
    pub fn upstreams_for(&self, subscription: &str) -> Vec<String> {
        self.entries
            .lock()
            .range(self.key(subscription, "")..)
            .take_while(|(k, _)| k.subscription == subscription)
            .map(|(k, _)| k.upstream.clone())
            .collect()
    }

    /// Number of live legs.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no legs are live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
