//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Handle for a recorder that is never installed globally.
pub fn metrics_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Open a downstream socket offering `graphql-transport-ws`.
///
/// Returns the socket and the subprotocol the server picked.
pub async fn connect(url: &str) -> (WsStream, Option<String>) {
    let mut request = url.into_client_request().unwrap();
    let _ = request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("graphql-transport-ws"),
    );
    let (ws, response) = timeout(TIMEOUT, connect_async(request))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let protocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    (ws, protocol)
}

/// Connect and complete the `connection_init` / `connection_ack` handshake.
pub async fn connect_ready(url: &str) -> WsStream {
    let (mut ws, _) = connect(url).await;
    send_json(&mut ws, json!({"type": "connection_init"})).await;
    let ack = read_json(&mut ws).await;
    assert_eq!(ack["type"], "connection_ack");
    ws
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

pub async fn subscribe(ws: &mut WsStream, id: &str, query: &str) {
    send_json(
        ws,
        json!({"type": "subscribe", "id": id, "payload": {"query": query}}),
    )
    .await;
}

pub async fn complete(ws: &mut WsStream, id: &str) {
    send_json(ws, json!({"type": "complete", "id": id})).await;
}

/// Next text frame as JSON, skipping control frames.
pub async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Wait for the server's close frame, skipping anything before it.
pub async fn read_close(ws: &mut WsStream) -> Option<CloseFrame> {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

/// Assert no text frame arrives within a short window.
pub async fn assert_no_frame(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected frame: {text}");
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
