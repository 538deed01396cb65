//! `graphql-transport-ws` client over `tokio-tungstenite`.
//!
//! Each [`GraphqlWsClient`] owns at most one socket, driven by a background
//! task. Callers talk to the task through a command channel, so
//! [`subscribe`](UpstreamClient::subscribe) never blocks on the network.
//!
//! The socket is opened lazily on the first subscription. If it drops, every
//! live operation gets an `error` event and the next subscription opens a
//! fresh socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use subrelay_settings::UpstreamDescriptor;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use super::client::{
    UpstreamClient, UpstreamConnector, UpstreamError, UpstreamEvent, UpstreamSubscription,
};
use crate::protocol::{Frame, GRAPHQL_TRANSPORT_WS, SubscribePayload, parse_frame};
use crate::subscription::CancelHandle;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EventSender = mpsc::UnboundedSender<UpstreamEvent>;

/// Instruction for the connection task.
enum Command {
    Subscribe {
        id: String,
        payload: SubscribePayload,
        events: EventSender,
    },
    Complete {
        id: String,
    },
}

/// Creates a [`GraphqlWsClient`] per upstream.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphqlWsConnector;

impl UpstreamConnector for GraphqlWsConnector {
    fn connect(&self, descriptor: &UpstreamDescriptor, ws_url: &str) -> Arc<dyn UpstreamClient> {
        Arc::new(GraphqlWsClient::new(&descriptor.name, ws_url))
    }
}

/// Subscription client for one upstream.
pub struct GraphqlWsClient {
    name: String,
    url: String,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    next_id: AtomicU64,
    disposed: CancellationToken,
}

impl GraphqlWsClient {
    /// Client for `url`. Nothing connects until the first subscription.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            commands: Mutex::new(None),
            next_id: AtomicU64::new(1),
            disposed: CancellationToken::new(),
        }
    }

    /// Upstream subscription URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a connection task is currently running.
    pub fn is_running(&self) -> bool {
        self.commands
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Sender for the live connection task, spawning one if needed.
    fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        let mut slot = self.commands.lock();
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("upstream", upstream = %self.name);
        drop(tokio::spawn(
            run_connection(self.url.clone(), rx, self.disposed.clone()).instrument(span),
        ));
        *slot = Some(tx.clone());
        tx
    }
}

impl UpstreamClient for GraphqlWsClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self, payload: SubscribePayload) -> Result<UpstreamSubscription, UpstreamError> {
        if self.disposed.is_cancelled() {
            return Err(UpstreamError::Disposed(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (events, events_rx) = mpsc::unbounded_channel();
        let commands = self.command_sender();
        commands
            .send(Command::Subscribe {
                id: id.clone(),
                payload,
                events,
            })
            .map_err(|_| {
                if self.disposed.is_cancelled() {
                    UpstreamError::Disposed(self.name.clone())
                } else {
                    UpstreamError::Closed("connection task exited".into())
                }
            })?;

        let cancel = CancelHandle::new(move || {
            let _ = commands.send(Command::Complete { id });
        });
        Ok(UpstreamSubscription {
            events: events_rx,
            cancel,
        })
    }

    fn dispose(&self) {
        self.disposed.cancel();
        let _ = self.commands.lock().take();
    }
}

impl Drop for GraphqlWsClient {
    fn drop(&mut self) {
        self.disposed.cancel();
    }
}

/// Connection task: runs the socket until disposal or failure.
async fn run_connection(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    disposed: CancellationToken,
) {
    let mut operations: HashMap<String, EventSender> = HashMap::new();
    let outcome = drive(&url, &mut commands, &mut operations, &disposed).await;

    // no new work lands here from now on; the next subscribe respawns
    commands.close();

    match outcome {
        Ok(()) => debug!("upstream connection closed"),
        Err(error) => {
            let message = error.to_string();
            let mut failed = operations.len();
            for (_, events) in operations.drain() {
                let _ = events.send(UpstreamEvent::error_message(&message));
            }
            while let Ok(command) = commands.try_recv() {
                if let Command::Subscribe { events, .. } = command {
                    failed += 1;
                    let _ = events.send(UpstreamEvent::error_message(&message));
                }
            }
            warn!(%error, failed_operations = failed, "upstream connection lost");
        }
    }
}

async fn drive(
    url: &str,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    operations: &mut HashMap<String, EventSender>,
    disposed: &CancellationToken,
) -> Result<(), UpstreamError> {
    let socket = tokio::select! {
        () = disposed.cancelled() => return Ok(()),
        socket = handshake(url) => socket?,
    };
    info!(url, "upstream connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            () = disposed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                };
                match command {
                    Command::Subscribe { id, payload, events } => {
                        trace!(operation_id = %id, "starting upstream operation");
                        let _ = operations.insert(id.clone(), events);
                        send_frame(&mut sink, &Frame::Subscribe { id, payload }).await?;
                    }
                    Command::Complete { id } => {
                        // already finished upstream: nothing to stop
                        if operations.remove(&id).is_some() {
                            trace!(operation_id = %id, "completing upstream operation");
                            send_frame(&mut sink, &Frame::Complete { id }).await?;
                        }
                    }
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = dispatch(text.as_str(), operations) {
                        send_frame(&mut sink, &reply).await?;
                    }
                }
                Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error.into()),
                None => return Err(UpstreamError::Closed("stream ended".into())),
            }
        }
    }
}

/// Open the socket and complete `connection_init` / `connection_ack`.
async fn handshake(url: &str) -> Result<WsStream, UpstreamError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| UpstreamError::InvalidUrl {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
    let _ = request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRAPHQL_TRANSPORT_WS),
    );

    let (mut socket, _response) = connect_async(request).await?;
    send_frame(&mut socket, &Frame::ConnectionInit { payload: None }).await?;

    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                Ok(Frame::ConnectionAck { .. }) => return Ok(socket),
                Ok(Frame::Ping { .. }) => {
                    send_frame(&mut socket, &Frame::Pong { payload: None }).await?;
                }
                Ok(other) => {
                    return Err(UpstreamError::Handshake(format!(
                        "expected connection_ack, got {}",
                        other.kind()
                    )));
                }
                Err(error) => return Err(UpstreamError::Handshake(error.to_string())),
            },
            Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
            Some(Ok(_)) => {}
            Some(Err(error)) => return Err(error.into()),
            None => return Err(UpstreamError::Closed("closed during handshake".into())),
        }
    }
}

/// Route one server frame to its operation. Returns a frame to send back.
fn dispatch(text: &str, operations: &mut HashMap<String, EventSender>) -> Option<Frame> {
    match parse_frame(text) {
        Ok(Frame::Next { id, payload }) => {
            match operations.get(&id) {
                Some(events) => {
                    let _ = events.send(UpstreamEvent::Next(payload));
                }
                None => trace!(operation_id = %id, "next for unknown operation"),
            }
            None
        }
        Ok(Frame::Error { id, payload }) => {
            if let Some(events) = operations.remove(&id) {
                let _ = events.send(UpstreamEvent::Error(payload));
            }
            None
        }
        Ok(Frame::Complete { id }) => {
            if let Some(events) = operations.remove(&id) {
                let _ = events.send(UpstreamEvent::Complete);
            }
            None
        }
        Ok(Frame::Ping { .. }) => Some(Frame::Pong { payload: None }),
        Ok(Frame::Pong { .. }) => None,
        Ok(other) => {
            warn!(frame_type = other.kind(), "unexpected frame from upstream");
            None
        }
        Err(error) => {
            warn!(%error, "undecodable frame from upstream");
            None
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), UpstreamError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::text(frame.to_text()?)).await?;
    Ok(())
}

fn closed(frame: Option<CloseFrame>) -> UpstreamError {
    let reason = frame
        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
        .unwrap_or_else(|| "no close frame".to_owned());
    UpstreamError::Closed(reason.trim_end().to_owned())
}
