//! Upstream subgraph connections.
//!
//! - [`client`]: the [`UpstreamClient`] / [`UpstreamConnector`] seam
//! - [`graphql_ws`]: the WebSocket implementation used in production
//! - [`pool`]: the per-connection set of clients

pub mod client;
pub mod graphql_ws;
pub mod pool;

pub use client::{
    UpstreamClient, UpstreamConnector, UpstreamError, UpstreamEvent, UpstreamSubscription,
};
pub use graphql_ws::{GraphqlWsClient, GraphqlWsConnector};
pub use pool::UpstreamPool;
