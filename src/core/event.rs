//! HTTP events
//!
//! One event per parsed request or response message. Events from the same
//! connection share a `stream_seq`; a response carries the transaction id of
//! the request it answers (0 when the request was never observed).

use chrono::{DateTime, Utc};

use super::headers::HeaderMap;

/// Fields common to request and response events.
#[derive(Debug, Clone)]
pub struct EventMeta {
    /// Capture timestamp of the first byte of the message.
    pub start: DateTime<Utc>,
    /// Capture timestamp of the last byte of the message.
    pub end: DateTime<Utc>,
    /// Connection sequence number, assigned at first sight of the flow.
    pub stream_seq: u64,
    /// Per-connection transaction id.
    pub id: u32,
    pub client_addr: String,
    pub server_addr: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub meta: EventMeta,
    pub method: String,
    pub uri: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub meta: EventMeta,
    pub version: String,
    pub code: u16,
    pub reason: String,
}

/// Tagged union carried on the event channel.
#[derive(Debug, Clone)]
pub enum HttpEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
}

impl HttpEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            HttpEvent::Request(r) => &r.meta,
            HttpEvent::Response(r) => &r.meta,
        }
    }

    pub fn stream_seq(&self) -> u64 {
        self.meta().stream_seq
    }

    pub fn id(&self) -> u32 {
        self.meta().id
    }

    pub fn is_request(&self) -> bool {
        matches!(self, HttpEvent::Request(_))
    }
}
