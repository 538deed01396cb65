//! Downstream connection state.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subrelay_settings::UpstreamDescriptor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::Frame;
use crate::subscription::SubscriptionTracker;
use crate::upstream::{UpstreamConnector, UpstreamPool};

/// Unique id of one downstream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything one downstream connection owns.
///
/// Created when the socket opens, consumed by [`teardown`](Self::teardown)
/// when it closes.
pub struct RelayConnection {
    id: ConnectionId,
    pool: UpstreamPool,
    tracker: Arc<SubscriptionTracker>,
    outbound: mpsc::Sender<Frame>,
}

/// What [`RelayConnection::teardown`] cleaned up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Teardown {
    /// Subscription legs cancelled.
    pub cancelled: usize,
    /// Upstream clients disposed.
    pub disposed: usize,
}

impl RelayConnection {
    /// Set up the upstream pool and an empty tracker.
    pub fn open(
        id: ConnectionId,
        upstreams: &[UpstreamDescriptor],
        connector: &dyn UpstreamConnector,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            pool: UpstreamPool::ensure(upstreams, connector),
            tracker: Arc::new(SubscriptionTracker::new(id)),
            outbound,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Upstream clients of this connection.
    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    /// Live subscription legs of this connection.
    pub fn tracker(&self) -> &Arc<SubscriptionTracker> {
        &self.tracker
    }

    /// Queue feeding the socket writer.
    pub fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound
    }

    /// Queue a frame for the client. Returns `false` if the writer is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Cancel every subscription, then dispose every upstream client.
    pub fn teardown(mut self) -> Teardown {
        let cancelled = self.tracker.cancel_all();
        let disposed = self.pool.dispose_all();
        Teardown {
            cancelled,
            disposed,
        }
    }
}

struct ActiveConnection {
    close: CancellationToken,
    connected_at: Instant,
}

/// Set of open downstream connections, used to close them all on shutdown.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ActiveConnection>,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    /// Empty registry. Connection close tokens are children of `shutdown`.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            connections: DashMap::new(),
            shutdown,
        }
    }

    /// Add a connection. The returned token fires when it must close.
    pub fn register(&self, id: ConnectionId) -> CancellationToken {
        let close = self.shutdown.child_token();
        let _ = self.connections.insert(
            id,
            ActiveConnection {
                close: close.clone(),
                connected_at: Instant::now(),
            },
        );
        close
    }

    /// Remove a connection. Returns how long it was open.
    pub fn deregister(&self, id: ConnectionId) -> Option<Duration> {
        self.connections
            .remove(&id)
            .map(|(_, conn)| conn.connected_at.elapsed())
    }

    /// Ask one connection to close.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(conn) => {
                conn.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask every open connection to close. Returns how many were asked.
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for conn in &self.connections {
            conn.close.cancel();
            count += 1;
        }
        count
    }

    /// Whether a connection is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Ids of open connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubscribePayload;
    use crate::subscription::CancelHandle;
    use crate::testing::MockConnector;
    use crate::upstream::UpstreamClient;

    fn upstreams() -> Vec<UpstreamDescriptor> {
        vec![
            UpstreamDescriptor::new("a", "http://a").with_ws_url("ws://a"),
            UpstreamDescriptor::new("b", "http://b").with_ws_url("ws://b"),
        ]
    }

    #[test]
    fn connection_ids_are_unique() {
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        assert_ne!(first, second);
        assert_eq!(first.as_uuid().get_version_num(), 7);
        assert_eq!(first.to_string(), first.as_uuid().to_string());
    }

    #[test]
    fn open_builds_pool_and_empty_tracker() {
        let connector = MockConnector::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn = RelayConnection::open(ConnectionId::new(), &upstreams(), &connector, tx);
        assert_eq!(conn.pool().names(), vec!["a", "b"]);
        assert!(conn.tracker().is_empty());
        assert_eq!(conn.tracker().connection(), conn.id());
    }

    #[test]
    fn teardown_cancels_then_disposes() {
        let connector = MockConnector::new();
        let (tx, _rx) = mpsc::channel(8);
        let conn = RelayConnection::open(ConnectionId::new(), &upstreams(), &connector, tx);

        let client = conn.pool().get("a").unwrap().clone();
        let sub = client.subscribe(SubscribePayload::new("subscription { x }")).unwrap();
        let _ = conn.tracker().register("1", "a", sub.cancel);
        let _ = conn.tracker().register("2", "b", CancelHandle::noop());

        let report = conn.teardown();
        assert_eq!(
            report,
            Teardown {
                cancelled: 2,
                disposed: 2,
            }
        );
        let mock = connector.latest("a").unwrap();
        assert_eq!(mock.last_operation().unwrap().cancel_count(), 1);
        assert_eq!(mock.dispose_count(), 1);
        assert_eq!(connector.latest("b").unwrap().dispose_count(), 1);
    }

    #[tokio::test]
    async fn send_fails_after_writer_dropped() {
        let connector = MockConnector::new();
        let (tx, rx) = mpsc::channel(8);
        let conn = RelayConnection::open(ConnectionId::new(), &[], &connector, tx);
        assert!(conn.send(Frame::ConnectionAck { payload: None }).await);
        drop(rx);
        assert!(!conn.send(Frame::ConnectionAck { payload: None }).await);
    }

    #[test]
    fn registry_register_and_deregister() {
        let registry = ConnectionRegistry::default();
        let id = ConnectionId::new();
        let _token = registry.register(id);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![id]);
        assert!(registry.deregister(id).is_some());
        assert!(registry.deregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_close_one() {
        let registry = ConnectionRegistry::default();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let ta = registry.register(a);
        let tb = registry.register(b);
        assert!(registry.close(a));
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        assert!(!registry.close(ConnectionId::new()));
    }

    #[test]
    fn registry_close_all() {
        let registry = ConnectionRegistry::default();
        let tokens: Vec<_> = (0..3).map(|_| registry.register(ConnectionId::new())).collect();
        assert_eq!(registry.close_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        // closing does not deregister; sessions do that on their way out
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn shutdown_token_closes_late_registrations() {
        let shutdown = CancellationToken::new();
        let registry = ConnectionRegistry::new(shutdown.clone());
        shutdown.cancel();
        let token = registry.register(ConnectionId::new());
        assert!(token.is_cancelled());
    }
}
