//! # subrelay-server
//!
//! GraphQL subscription relay speaking `graphql-transport-ws` on both legs.
//!
//! - Downstream: Axum WebSocket endpoint, one session per client
//! - Upstream: one lazily connected client per (connection, subgraph)
//! - Fan-out: each client `subscribe` goes to every subgraph with a
//!   subscription URL, and results come back under the client's id
//! - Cancellation: a client `complete` or disconnect stops every upstream leg
//! - Graceful shutdown via `CancellationToken`
//! - Prometheus metrics at `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod subscription;
pub mod testing;
pub mod upstream;
pub mod websocket;

pub use config::ServerConfig;
pub use protocol::{Frame, FrameError, GRAPHQL_TRANSPORT_WS, SubscribePayload};
pub use server::{RelayContext, RelayServer, ServerError};
pub use upstream::{GraphqlWsConnector, UpstreamClient, UpstreamConnector};
