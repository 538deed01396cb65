//! In-memory upstreams for tests.
//!
//! [`MockConnector`] hands out [`MockClient`]s and remembers every one of
//! them, so a test can drive upstream events by hand and then inspect what
//! the relay cancelled and disposed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use subrelay_settings::UpstreamDescriptor;
use tokio::sync::mpsc;

use crate::protocol::SubscribePayload;
use crate::subscription::CancelHandle;
use crate::upstream::{
    UpstreamClient, UpstreamConnector, UpstreamError, UpstreamEvent, UpstreamSubscription,
};

/// Records every client it creates.
#[derive(Default)]
pub struct MockConnector {
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockConnector {
    /// Connector with no clients yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client created so far, oldest first.
    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }

    /// Clients created for a named upstream, oldest first.
    pub fn clients_for(&self, name: &str) -> Vec<Arc<MockClient>> {
        self.clients
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    /// Most recent client for a named upstream.
    pub fn latest(&self, name: &str) -> Option<Arc<MockClient>> {
        self.clients
            .lock()
            .iter()
            .rev()
            .find(|c| c.name == name)
            .cloned()
    }
}

impl UpstreamConnector for MockConnector {
    fn connect(&self, descriptor: &UpstreamDescriptor, ws_url: &str) -> Arc<dyn UpstreamClient> {
        let client = Arc::new(MockClient::new(&descriptor.name, ws_url));
        self.clients.lock().push(client.clone());
        client
    }
}

/// One operation started on a [`MockClient`].
#[derive(Clone)]
pub struct MockOperation {
    /// What the relay asked the upstream to run.
    pub payload: SubscribePayload,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    cancels: Arc<AtomicUsize>,
}

impl MockOperation {
    /// Deliver an event to the relay. Returns `false` once nobody listens.
    pub fn emit(&self, event: UpstreamEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// How many times the relay cancelled this operation.
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Whether the relay stopped listening.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Scripted upstream client.
pub struct MockClient {
    name: String,
    ws_url: String,
    operations: Mutex<Vec<MockOperation>>,
    disposals: AtomicUsize,
    reject_with: Mutex<Option<String>>,
}

impl MockClient {
    fn new(name: &str, ws_url: &str) -> Self {
        Self {
            name: name.to_owned(),
            ws_url: ws_url.to_owned(),
            operations: Mutex::new(Vec::new()),
            disposals: AtomicUsize::new(0),
            reject_with: Mutex::new(None),
        }
    }

    /// URL the client was created for.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Make later `subscribe` calls fail with a handshake error.
    pub fn reject_subscriptions(&self, reason: impl Into<String>) {
        *self.reject_with.lock() = Some(reason.into());
    }

    /// Operations started so far, oldest first.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.operations.lock().clone()
    }

    /// Number of operations started.
    pub fn subscribe_count(&self) -> usize {
        self.operations.lock().len()
    }

    /// Most recent operation.
    pub fn last_operation(&self) -> Option<MockOperation> {
        self.operations.lock().last().cloned()
    }

    /// How many times `dispose` was called.
    pub fn dispose_count(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Whether the client was disposed.
    pub fn is_disposed(&self) -> bool {
        self.dispose_count() > 0
    }
}

impl UpstreamClient for MockClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, payload: SubscribePayload) -> Result<UpstreamSubscription, UpstreamError> {
        if self.is_disposed() {
            return Err(UpstreamError::Disposed(self.name.clone()));
        }
        if let Some(reason) = self.reject_with.lock().clone() {
            return Err(UpstreamError::Handshake(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        self.operations.lock().push(MockOperation {
            payload,
            events: tx,
            cancels,
        });

        Ok(UpstreamSubscription {
            events: rx,
            cancel: CancelHandle::new(move || {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }

    fn dispose(&self) {
        let _ = self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}
