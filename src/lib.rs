//! httpscope — passive HTTP/1.x traffic observer
//!
//! Captures packets from a live interface or a pcap file, reassembles the
//! TCP byte streams, parses the HTTP/1.x messages riding on them, and emits
//! a normalized, ordered sequence of request/response events to a chain of
//! sinks.
//!
//! Data flow:
//!
//! ```text
//! packet source -> capture loop -> reassembler -> factory -> stream/reader
//!     -> http parser -> pair engine -> event channel -> fan-out -> sinks
//! ```
//!
//! The capture loop is the single producer; each TCP connection runs its
//! two halves on their own tasks sharing one pair; a single dispatcher
//! task fans events out to the sinks.

pub mod capture;
pub mod core;
pub mod http;
pub mod reassembly;
pub mod sink;
pub mod stream;

pub use crate::capture::{CaptureConfig, PcapMirror};
pub use crate::core::{HeaderMap, HttpEvent, RequestEvent, ResponseEvent, StreamKey};
pub use crate::sink::{EventJsonWriter, EventPrinter, EventSink};
pub use crate::stream::{Factory, MethodFilter};
