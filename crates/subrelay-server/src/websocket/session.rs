//! WebSocket session lifecycle: one downstream client from upgrade to teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ConnectionId, RelayConnection};
use super::handler::handle_message;
use crate::metrics::{
    UPSTREAM_DISPOSALS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::protocol::Frame;
use crate::server::RelayContext;

/// How long the writer may take to deliver the close frame on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Run a session for a freshly upgraded socket.
///
/// 1. Registers the connection and builds its upstream pool
/// 2. Spawns the writer, the only task that touches the socket sink
/// 3. Dispatches inbound text frames until the client leaves or shutdown
/// 4. Tears down: cancel subscriptions, dispose upstreams, deregister
#[instrument(skip_all, fields(connection_id = %id))]
pub async fn run_session(ws: WebSocket, id: ConnectionId, ctx: Arc<RelayContext>) {
    let close = ctx.connections.register(id);
    let connection_start = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    let (ws_tx, mut ws_rx) = ws.split();

    let (out_tx, out_rx) = mpsc::channel::<Frame>(ctx.config.outbound_buffer);
    let connection = RelayConnection::open(id, &ctx.upstreams, ctx.connector.as_ref(), out_tx);
    info!(upstreams = connection.pool().len(), "client connected");

    let writer = tokio::spawn(write_frames(ws_tx, out_rx, close.clone()));

    let mut shutting_down = false;
    loop {
        let message = tokio::select! {
            () = close.cancelled() => {
                shutting_down = true;
                break;
            }
            message = ws_rx.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let _ = handle_message(text.as_str(), &connection).await;
            }
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => {
                    let _ = handle_message(text, &connection).await;
                }
                Err(_) => info!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Some(Ok(Message::Close(_))) => {
                debug!("client sent close frame");
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            // the stream ends after an error; the next poll yields None
            Some(Err(error)) => warn!(%error, "downstream socket error"),
            None => break,
        }
    }

    let report = connection.teardown();
    if shutting_down {
        if !join_writer(writer, CLOSE_GRACE).await {
            debug!("writer aborted after close grace");
        }
    } else {
        writer.abort();
    }
    let duration = ctx.connections.deregister(id);

    let disposed = u64::try_from(report.disposed).unwrap_or(u64::MAX);
    counter!(UPSTREAM_DISPOSALS_TOTAL).increment(disposed);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());

    info!(
        cancelled = report.cancelled,
        disposed = report.disposed,
        duration_ms = duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        shutdown = shutting_down,
        "client disconnected"
    );
}

/// Wait up to `grace` for the writer, aborting it if it is still stuck.
///
/// Returns `false` if the writer had to be aborted.
async fn join_writer(writer: JoinHandle<()>, grace: Duration) -> bool {
    let abort = writer.abort_handle();
    if tokio::time::timeout(grace, writer).await.is_ok() {
        return true;
    }
    abort.abort();
    false
}

/// Drain the outbound queue into the socket.
///
/// On `close`, sends a going-away close frame and stops.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Frame>,
    close: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = close.cancelled() => {
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: Utf8Bytes::from_static("server shutting down"),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                break;
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame.to_text() {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            debug!("socket closed while writing");
                            break;
                        }
                    }
                    Err(error) => warn!(%error, frame_type = frame.kind(), "failed to encode frame"),
                }
            }
        }
    }
}
