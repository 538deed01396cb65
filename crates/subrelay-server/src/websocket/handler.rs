//! Downstream frame handling.
//!
//! A client `subscribe` is fanned out to every upstream client of the
//! connection. Each upstream leg gets its own forwarding task that relays
//! events back under the client's id, in the order that upstream sent them.
//! Legs are registered in the tracker before their task starts, so a
//! `complete` can always find them.

use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use super::connection::RelayConnection;
use crate::metrics::{
    SUBSCRIPTION_LEGS_ACTIVE, SUBSCRIPTIONS_REJECTED_TOTAL, SUBSCRIPTIONS_TOTAL,
    UPSTREAM_ERRORS_TOTAL,
};
use crate::protocol::{Frame, SubscribePayload, parse_frame};
use crate::subscription::{CancelHandle, Registration, SubscriptionTracker};
use crate::upstream::{UpstreamEvent, UpstreamSubscription};

/// Error message sent when a subscribe arrives but no upstream can serve it.
pub const NO_UPSTREAMS: &str = "No upstream supports subscriptions";

/// What a downstream frame did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handled {
    /// `connection_init` answered with `connection_ack`.
    Acknowledged,
    /// `subscribe` fanned out to this many upstreams.
    Subscribed {
        /// Client operation id.
        id: String,
        /// Upstream legs started.
        upstreams: usize,
    },
    /// `subscribe` refused with an `error` frame.
    Rejected {
        /// Client operation id.
        id: String,
        /// Message sent to the client.
        reason: String,
    },
    /// `complete` cancelled this many legs.
    Cancelled {
        /// Client operation id.
        id: String,
        /// Upstream legs cancelled.
        legs: usize,
    },
    /// Undecodable or unsupported frame, logged and dropped.
    Ignored,
}

/// Handle one text frame from the client.
pub async fn handle_message(text: &str, conn: &RelayConnection) -> Handled {
    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(%error, "ignoring undecodable frame");
            return Handled::Ignored;
        }
    };

    match frame {
        Frame::ConnectionInit { .. } => {
            if !conn.send(Frame::ConnectionAck { payload: None }).await {
                debug!("writer gone before connection_ack");
            }
            Handled::Acknowledged
        }
        Frame::Subscribe { id, payload } if payload.query.is_empty() => {
            warn!(subscription_id = %id, "ignoring subscribe with empty query");
            Handled::Ignored
        }
        Frame::Subscribe { id, payload } => subscribe(conn, id, payload).await,
        Frame::Complete { id } => {
            let legs = conn.tracker().cancel_by_id(&id);
            debug!(subscription_id = %id, legs, "subscription completed by client");
            Handled::Cancelled { id, legs }
        }
        other => {
            debug!(frame_type = other.kind(), "ignoring unsupported frame");
            Handled::Ignored
        }
    }
}

async fn subscribe(conn: &RelayConnection, id: String, payload: SubscribePayload) -> Handled {
    if conn.tracker().contains_id(&id) {
        let reason = format!("Subscriber for {id} already exists");
        warn!(subscription_id = %id, "duplicate subscription id");
        counter!(SUBSCRIPTIONS_REJECTED_TOTAL, "reason" => "duplicate_id").increment(1);
        return reject(conn, id, reason).await;
    }
    if conn.pool().is_empty() {
        warn!(subscription_id = %id, "no upstream supports subscriptions");
        counter!(SUBSCRIPTIONS_REJECTED_TOTAL, "reason" => "no_upstreams").increment(1);
        return reject(conn, id, NO_UPSTREAMS.to_owned()).await;
    }

    counter!(SUBSCRIPTIONS_TOTAL).increment(1);
    let mut started = 0;
    let mut failures = Vec::new();
    for client in conn.pool().clients() {
        match client.subscribe(payload.clone()) {
            Ok(subscription) => {
                start_forwarding(conn, &id, client.name(), subscription);
                started += 1;
            }
            Err(error) => {
                warn!(subscription_id = %id, upstream = client.name(), %error, "upstream subscribe failed");
                counter!(UPSTREAM_ERRORS_TOTAL, "upstream" => client.name().to_owned()).increment(1);
                failures.push(format!("{}: {error}", client.name()));
            }
        }
    }

    for message in failures {
        let _ = conn.send(Frame::error_message(&id, message)).await;
    }

    info!(subscription_id = %id, upstreams = started, "subscription started");
    Handled::Subscribed { id, upstreams: started }
}

async fn reject(conn: &RelayConnection, id: String, reason: String) -> Handled {
    let _ = conn.send(Frame::error_message(&id, &reason)).await;
    Handled::Rejected { id, reason }
}

/// Register one leg and spawn its forwarding task.
fn start_forwarding(
    conn: &RelayConnection,
    id: &str,
    upstream: &str,
    subscription: UpstreamSubscription,
) {
    let UpstreamSubscription { events, cancel } = subscription;

    let stop = CancellationToken::new();
    let stop_forwarding = stop.clone();
    let handle = CancelHandle::new(move || stop_forwarding.cancel()).then(cancel);
    let registration = conn.tracker().register(id, upstream, handle);

    let span = debug_span!("forward", subscription_id = %id, upstream);
    gauge!(SUBSCRIPTION_LEGS_ACTIVE).increment(1.0);
    drop(tokio::spawn(
        forward(
            id.to_owned(),
            upstream.to_owned(),
            events,
            conn.outbound().clone(),
            stop,
            conn.tracker().clone(),
            registration,
        )
        .instrument(span),
    ));
}

/// Relay one leg's events until it ends, is cancelled, or the writer goes away.
async fn forward(
    id: String,
    upstream: String,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
    outbound: mpsc::Sender<Frame>,
    stop: CancellationToken,
    tracker: Arc<SubscriptionTracker>,
    registration: Registration,
) {
    if relay_events(&id, &upstream, events, &outbound, &stop).await {
        // ended on its own: forget it without cancelling upstream
        let _ = tracker.release(&registration);
    }
    gauge!(SUBSCRIPTION_LEGS_ACTIVE).decrement(1.0);
}

/// Returns `true` if the upstream stream ended, `false` if the leg was
/// stopped or the writer is gone.
async fn relay_events(
    id: &str,
    upstream: &str,
    mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    outbound: &mpsc::Sender<Frame>,
    stop: &CancellationToken,
) -> bool {
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => return false,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            debug!("upstream dropped the operation");
            return true;
        };

        if matches!(event, UpstreamEvent::Error(_)) {
            counter!(UPSTREAM_ERRORS_TOTAL, "upstream" => upstream.to_owned()).increment(1);
        }
        let terminal = event.is_terminal();
        tokio::select! {
            biased;
            () = stop.cancelled() => return false,
            sent = outbound.send(event.into_frame(id.to_owned())) => {
                if sent.is_err() {
                    return false;
                }
            }
        }
        if terminal {
            return true;
        }
    }
}
