//! The upstream client seam.
//!
//! The relay only needs three things from an upstream: start an operation
//! and get its events, stop it, and tear the whole client down. Keeping
//! that behind [`UpstreamClient`] lets tests substitute an in-memory
//! upstream for the real WebSocket one.

use std::sync::Arc;

use serde_json::Value;
use subrelay_settings::UpstreamDescriptor;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{Frame, SubscribePayload, error_entry};
use crate::subscription::CancelHandle;

/// Something an upstream operation produced.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    /// One execution result.
    Next(Value),
    /// The operation failed. Terminal.
    Error(Vec<Value>),
    /// The operation finished. Terminal.
    Complete,
}

impl UpstreamEvent {
    /// Error event with a single message.
    pub fn error_message(message: impl Into<String>) -> Self {
        Self::Error(vec![error_entry(message)])
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }

    /// The downstream frame relaying this event under `id`.
    pub fn into_frame(self, id: String) -> Frame {
        match self {
            Self::Next(payload) => Frame::Next { id, payload },
            Self::Error(payload) => Frame::Error { id, payload },
            Self::Complete => Frame::Complete { id },
        }
    }
}

/// A started upstream operation.
#[derive(Debug)]
pub struct UpstreamSubscription {
    /// Events in upstream order. The sender is dropped after a terminal
    /// event, or without one if the client is disposed.
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
    /// Stops the operation upstream. Safe to call after it finished.
    pub cancel: CancelHandle,
}

/// Errors raised by upstream clients.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The client was disposed and accepts no new operations.
    #[error("upstream client {0} has been disposed")]
    Disposed(String),
    /// The upstream URL could not be turned into a WebSocket request.
    #[error("invalid upstream url {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
    /// WebSocket transport failure.
    #[error("upstream transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    /// The upstream did not complete the `connection_init` handshake.
    #[error("upstream handshake failed: {0}")]
    Handshake(String),
    /// The upstream closed the socket.
    #[error("upstream closed the connection: {0}")]
    Closed(String),
    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A subscription-capable connection to one upstream.
pub trait UpstreamClient: Send + Sync {
    /// Upstream name, unique within the configuration.
    fn name(&self) -> &str;

    /// Start an operation.
    ///
    /// Does not wait for the upstream. Connection failures surface later as
    /// an [`UpstreamEvent::Error`] on the returned stream.
    fn subscribe(&self, payload: SubscribePayload) -> Result<UpstreamSubscription, UpstreamError>;

    /// Close the upstream connection and end every active operation.
    ///
    /// Idempotent. Later [`subscribe`](Self::subscribe) calls fail with
    /// [`UpstreamError::Disposed`].
    fn dispose(&self);
}

/// Creates upstream clients. One client per (connection, upstream).
pub trait UpstreamConnector: Send + Sync {
    /// Client for `descriptor`, which is known to have a subscription URL.
    fn connect(&self, descriptor: &UpstreamDescriptor, ws_url: &str) -> Arc<dyn UpstreamClient>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_events() {
        assert!(!UpstreamEvent::Next(json!({})).is_terminal());
        assert!(UpstreamEvent::Complete.is_terminal());
        assert!(UpstreamEvent::error_message("x").is_terminal());
    }

    #[test]
    fn event_into_frame() {
        assert_eq!(
            UpstreamEvent::Next(json!({"data": 1})).into_frame("7".into()),
            Frame::Next {
                id: "7".into(),
                payload: json!({"data": 1}),
            }
        );
        assert_eq!(
            UpstreamEvent::Complete.into_frame("7".into()),
            Frame::Complete { id: "7".into() }
        );
        assert_eq!(
            UpstreamEvent::error_message("boom").into_frame("7".into()),
            Frame::error_message("7", "boom")
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(
            UpstreamError::Disposed("reviews".into()).to_string(),
            "upstream client reviews has been disposed"
        );
        assert_eq!(
            UpstreamError::Closed("going away".into()).to_string(),
            "upstream closed the connection: going away"
        );
    }
}
