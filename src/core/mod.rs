//! Core shared types for the stream-to-event pipeline
//!
//! Provides the data model used by every stage:
//! - `StreamKey`: directional identity of one half of a TCP connection
//! - `HeaderMap`: insertion-ordered, case-insensitive header multimap
//! - `HttpEvent`: request/response events published on the event channel

pub mod event;
pub mod headers;
pub mod key;

pub use event::{EventMeta, HttpEvent, RequestEvent, ResponseEvent};
pub use headers::{Header, HeaderMap};
pub use key::StreamKey;
