//! `RelayServer`: Axum HTTP + WebSocket listener for the subscription relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use subrelay_settings::UpstreamDescriptor;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::protocol::GRAPHQL_TRANSPORT_WS;
use crate::shutdown::ShutdownCoordinator;
use crate::upstream::UpstreamConnector;
use crate::websocket::connection::{ConnectionId, ConnectionRegistry};
use crate::websocket::session::run_session;

/// Errors starting the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `listen` was called twice.
    #[error("relay server is already listening")]
    AlreadyListening,
    /// Other socket I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// State shared by every route and session.
pub struct RelayContext {
    /// Listener configuration.
    pub config: ServerConfig,
    /// All configured upstreams, in configuration order.
    pub upstreams: Arc<[UpstreamDescriptor]>,
    /// Builds per-connection upstream clients.
    pub connector: Arc<dyn UpstreamConnector>,
    /// Open downstream connections.
    pub connections: ConnectionRegistry,
    /// Shutdown signal for the listener and every connection.
    pub shutdown: ShutdownCoordinator,
    /// Running session tasks.
    pub sessions: TaskTracker,
    /// When the server was created.
    pub start_time: Instant,
    /// Renders `/metrics`.
    pub metrics: PrometheusHandle,
}

/// The subscription relay server.
pub struct RelayServer {
    context: Arc<RelayContext>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(
        config: ServerConfig,
        upstreams: Vec<UpstreamDescriptor>,
        connector: Arc<dyn UpstreamConnector>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let connections = ConnectionRegistry::new(shutdown.token());
        Self {
            context: Arc::new(RelayContext {
                config,
                upstreams: upstreams.into(),
                connector,
                connections,
                shutdown,
                sessions: TaskTracker::new(),
                start_time: Instant::now(),
                metrics: metrics_handle,
            }),
            listener_task: Mutex::new(None),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.context.config.path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.context.clone())
    }

    /// Bind the configured address and start serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port `0` was requested.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if self.listener_task.lock().is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let config = &self.context.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let shutdown = self.context.shutdown.token();
        let task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(%error, "relay listener failed");
            }
        });
        *self.listener_task.lock() = Some(task);

        info!(addr = %local_addr, path = %config.path, "subscription relay listening");
        Ok(local_addr)
    }

    /// Close every connection, then stop the listener.
    ///
    /// Waits up to the configured shutdown timeout for sessions to finish
    /// their teardown. Returns `false` if that wait timed out.
    pub async fn stop(&self) -> bool {
        let ctx = &self.context;
        let closing = ctx.connections.close_all();
        info!(connections = closing, "stopping subscription relay");

        let handles: Vec<_> = self.listener_task.lock().take().into_iter().collect();
        let timeout = ctx.config.shutdown_timeout();
        let listener_done = ctx.shutdown.graceful_shutdown(handles, Some(timeout)).await;

        let _ = ctx.sessions.close();
        let sessions_done = tokio::time::timeout(timeout, ctx.sessions.wait()).await.is_ok();
        if !sessions_done {
            warn!(remaining = ctx.connections.len(), "sessions still running after shutdown timeout");
        }

        info!("subscription relay stopped");
        listener_done && sessions_done
    }

    /// Shared state.
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.context
    }

    /// Open downstream connections.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.context.connections
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.context.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

/// GET /graphql: upgrade to a `graphql-transport-ws` session.
async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<RelayContext>>) -> Response {
    if ctx.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let id = ConnectionId::new();
    let sessions = ctx.sessions.clone();
    ws.protocols([GRAPHQL_TRANSPORT_WS])
        .max_message_size(ctx.config.max_message_size)
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| sessions.track_future(run_session(socket, id, ctx)))
}

/// GET /health
async fn health_handler(State(ctx): State<Arc<RelayContext>>) -> Json<HealthResponse> {
    let subscription_upstreams = ctx
        .upstreams
        .iter()
        .filter(|u| u.supports_subscriptions())
        .count();
    Json(health::health_check(
        ctx.start_time,
        ctx.shutdown.is_shutting_down(),
        ctx.connections.len(),
        ctx.upstreams.len(),
        subscription_upstreams,
    ))
}

/// GET /metrics
async fn metrics_handler(State(ctx): State<Arc<RelayContext>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&ctx.metrics),
    )
}
