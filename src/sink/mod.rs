//! Event fan-out
//!
//! A fixed, ordered list of sinks consumes the event channel through a
//! single dispatcher task: every sink sees every event, in registration
//! order, strictly serially. Sinks that need buffering own it internally.

pub mod json;
pub mod printer;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::event::HttpEvent;

pub use json::EventJsonWriter;
pub use printer::EventPrinter;

/// A consumer of HTTP events.
#[async_trait]
pub trait EventSink: Send {
    /// Handle one event. Must be non-blocking or short-blocking; slow sinks
    /// hold up the whole chain by design (backpressure propagates to the
    /// capture side).
    async fn push_event(&mut self, event: &HttpEvent);

    /// Called once after the event channel closes; drains internal queues
    /// and releases resources.
    async fn wait(&mut self);
}

/// Read the event channel until it closes, fanning out to every sink.
pub async fn dispatch(mut events: mpsc::Receiver<HttpEvent>, mut sinks: Vec<Box<dyn EventSink>>) {
    while let Some(event) = events.recv().await {
        for sink in sinks.iter_mut() {
            sink.push_event(&event).await;
        }
    }

    debug!("event channel closed, draining sinks");
    for sink in sinks.iter_mut() {
        sink.wait().await;
    }
}
