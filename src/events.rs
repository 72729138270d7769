//! Request-lifecycle event broadcast.
//!
//! The proxy engine publishes one [`ProxyEvent::RequestStarted`] per
//! captured exchange, followed by exactly one `RequestCompleted` or
//! `RequestFailed` for the same id. Delivery is best-effort: a subscriber
//! that falls behind loses the oldest events and receives a single
//! [`ProxyEvent::Lag`] carrying the drop count. Emission never blocks.

use crate::models::Exchange;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Per-subscriber buffer size before old events are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Failure classification surfaced on `RequestFailed` events and recorded
/// on the exchange as an error-kind pseudo-field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error,
)]
pub enum ErrorKind {
    #[error("DNS_FAILURE")]
    #[serde(rename = "DNS_FAILURE")]
    DnsFailure,
    #[error("UPSTREAM_CONNECT")]
    #[serde(rename = "UPSTREAM_CONNECT")]
    UpstreamConnect,
    #[error("UPSTREAM_TLS")]
    #[serde(rename = "UPSTREAM_TLS")]
    UpstreamTls,
    #[error("UPSTREAM_PROTOCOL")]
    #[serde(rename = "UPSTREAM_PROTOCOL")]
    UpstreamProtocol,
    #[error("CLIENT_DISCONNECT")]
    #[serde(rename = "CLIENT_DISCONNECT")]
    ClientDisconnect,
    #[error("CLIENT_TLS")]
    #[serde(rename = "CLIENT_TLS")]
    ClientTls,
    #[error("TIMEOUT")]
    #[serde(rename = "TIMEOUT")]
    Timeout,
    /// Soft condition: a captured body hit the capture cap.
    #[error("TRUNCATED_BODY")]
    #[serde(rename = "TRUNCATED_BODY")]
    TruncatedBody,
    #[error("STORE_WRITE")]
    #[serde(rename = "STORE_WRITE")]
    StoreWrite,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DnsFailure => "DNS_FAILURE",
            ErrorKind::UpstreamConnect => "UPSTREAM_CONNECT",
            ErrorKind::UpstreamTls => "UPSTREAM_TLS",
            ErrorKind::UpstreamProtocol => "UPSTREAM_PROTOCOL",
            ErrorKind::ClientDisconnect => "CLIENT_DISCONNECT",
            ErrorKind::ClientTls => "CLIENT_TLS",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::TruncatedBody => "TRUNCATED_BODY",
            ErrorKind::StoreWrite => "STORE_WRITE",
        }
    }
}

/// One record on the event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyEvent {
    /// A complete request head was received and stored.
    RequestStarted { id: i64, exchange: Exchange },
    /// The exchange finished and the stored row now carries both halves.
    RequestCompleted { id: i64, exchange: Exchange },
    /// The exchange ended in a failure; the row is closed out regardless.
    RequestFailed { id: i64, error: ErrorKind },
    /// This subscriber fell behind and `dropped` events were discarded.
    Lag { dropped: u64 },
}

impl ProxyEvent {
    /// Exchange id the event refers to, if any.
    pub fn id(&self) -> Option<i64> {
        match self {
            ProxyEvent::RequestStarted { id, .. }
            | ProxyEvent::RequestCompleted { id, .. }
            | ProxyEvent::RequestFailed { id, .. } => Some(*id),
            ProxyEvent::Lag { .. } => None,
        }
    }
}

/// Fan-out handle shared by the engine and any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; a send with no subscribers is fine.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving side of the bus.
pub struct EventSubscriber {
    rx: broadcast::Receiver<ProxyEvent>,
}

impl EventSubscriber {
    /// Next event, or `None` once the bus is gone. Buffer overflow shows
    /// up in-stream as a [`ProxyEvent::Lag`] rather than an error.
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                Some(ProxyEvent::Lag { dropped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
