//! Per-connection set of upstream clients.

use std::sync::Arc;

use subrelay_settings::UpstreamDescriptor;
use tracing::debug;

use super::client::{UpstreamClient, UpstreamConnector};

/// Upstream clients owned by one downstream connection.
///
/// Holds exactly one client per upstream that has a subscription URL, in
/// configuration order. Upstreams without one are skipped.
pub struct UpstreamPool {
    clients: Vec<Arc<dyn UpstreamClient>>,
}

impl UpstreamPool {
    /// Build the pool for a new connection.
    ///
    /// Client construction is lazy on the network side: nothing connects
    /// until the first subscription.
    pub fn ensure(descriptors: &[UpstreamDescriptor], connector: &dyn UpstreamConnector) -> Self {
        let clients = descriptors
            .iter()
            .filter_map(|descriptor| {
                let ws_url = descriptor.ws_url.as_deref()?;
                debug!(upstream = %descriptor.name, ws_url, "creating upstream client");
                Some(connector.connect(descriptor, ws_url))
            })
            .collect();
        Self { clients }
    }

    /// Clients in configuration order.
    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn UpstreamClient>> {
        self.clients.iter()
    }

    /// Client for a named upstream.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn UpstreamClient>> {
        self.clients.iter().find(|c| c.name() == name)
    }

    /// Upstream names in configuration order.
    pub fn names(&self) -> Vec<&str> {
        self.clients.iter().map(|c| c.name()).collect()
    }

    /// Number of clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no configured upstream supports subscriptions.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Dispose every client and empty the pool.
    pub fn dispose_all(&mut self) -> usize {
        let clients = std::mem::take(&mut self.clients);
        for client in &clients {
            debug!(upstream = client.name(), "disposing upstream client");
            client.dispose();
        }
        clients.len()
    }
}
