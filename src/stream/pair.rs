//! Per-connection transaction engine
//!
//! One `Pair` serves the two halves of a TCP connection; each half runs the
//! same loop in its own task: read a first line, dispatch to the request or
//! response handler, emit an event, repeat. Request ids flow to the response
//! half through a bounded queue, FIFO order matching HTTP/1.1 pipelining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::event::{EventMeta, HttpEvent, RequestEvent, ResponseEvent};
use crate::core::key::StreamKey;
use crate::http::parser::{self, Direction, FirstLine, ParseError};
use crate::stream::factory::MethodFilter;
use crate::stream::reader::Reader;

/// Ids queued between the request and response halves. Beyond this depth
/// ids are dropped and the responses correlate as 0.
const ID_QUEUE_CAPACITY: usize = 10_000;

#[derive(Default)]
struct PairShared {
    /// Method of the most recent request, for HEAD response framing.
    method: String,
    client_addr: String,
    server_addr: String,
}

pub struct Pair {
    stream_seq: u64,
    event_tx: mpsc::Sender<HttpEvent>,
    only_requests: bool,
    next_id: AtomicU32,
    ids: Mutex<VecDeque<u32>>,
    shared: Mutex<PairShared>,
}

impl Pair {
    pub fn new(stream_seq: u64, event_tx: mpsc::Sender<HttpEvent>, only_requests: bool) -> Arc<Self> {
        Arc::new(Self {
            stream_seq,
            event_tx,
            only_requests,
            next_id: AtomicU32::new(0),
            ids: Mutex::new(VecDeque::new()),
            shared: Mutex::new(PairShared::default()),
        })
    }

    /// Parse one half-stream to completion.
    pub async fn run(&self, key: StreamKey, mut reader: Reader, filter: &MethodFilter) {
        let mut dir = Direction::Unknown;
        loop {
            match self.transaction(&mut dir, key, &mut reader, filter).await {
                Ok(()) => {}
                Err(e) if e.is_eof() => {
                    debug!(stream = %key, "stream closed");
                    return;
                }
                Err(e) => {
                    // Framing is lost; the stream cannot be resynchronized.
                    warn!(stream = %key, error = %e, "abandoning stream");
                    return;
                }
            }
        }
    }

    async fn transaction(
        &self,
        dir: &mut Direction,
        key: StreamKey,
        reader: &mut Reader,
        filter: &MethodFilter,
    ) -> Result<(), ParseError> {
        match parser::parse_first_line(reader, *dir).await? {
            FirstLine::Request {
                method,
                uri,
                version,
            } => {
                *dir = Direction::Request;
                self.handle_request(key, reader, method, uri, version, filter)
                    .await
            }
            FirstLine::Response {
                version,
                code,
                reason,
            } => {
                *dir = Direction::Response;
                self.handle_response(reader, version, code, reason).await
            }
        }
    }

    async fn handle_request(
        &self,
        key: StreamKey,
        reader: &mut Reader,
        method: String,
        uri: String,
        version: String,
        filter: &MethodFilter,
    ) -> Result<(), ParseError> {
        let start = reader.last_seen();
        let headers = parser::parse_headers(reader).await?;

        {
            let mut shared = self.shared.lock();
            shared.client_addr = key.src_addr();
            shared.server_addr = key.dst_addr();
        }

        let body = parser::parse_body(reader, &method, &headers, true).await?;

        self.shared.lock().method = method.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut ids = self.ids.lock();
            if ids.len() < ID_QUEUE_CAPACITY {
                ids.push_back(id);
            }
        }

        if !filter.allows(&method) {
            return Ok(());
        }

        let (client_addr, server_addr) = self.addrs();
        let event = HttpEvent::Request(RequestEvent {
            meta: EventMeta {
                start,
                end: reader.last_seen(),
                stream_seq: self.stream_seq,
                id,
                client_addr,
                server_addr,
                headers,
                body,
            },
            method,
            uri,
            version,
        });
        let _ = self.event_tx.send(event).await;
        Ok(())
    }

    async fn handle_response(
        &self,
        reader: &mut Reader,
        version: String,
        code: u16,
        reason: String,
    ) -> Result<(), ParseError> {
        let start = reader.last_seen();
        let headers = parser::parse_headers(reader).await?;

        let method = self.shared.lock().method.clone();
        let body = parser::parse_body(reader, &method, &headers, false).await?;

        // 0 when no request was observed for this response.
        let id = self.ids.lock().pop_front().unwrap_or(0);

        if self.only_requests {
            return Ok(());
        }

        let (client_addr, server_addr) = self.addrs();
        let event = HttpEvent::Response(ResponseEvent {
            meta: EventMeta {
                start,
                end: reader.last_seen(),
                stream_seq: self.stream_seq,
                id,
                client_addr,
                server_addr,
                headers,
                body,
            },
            version,
            code,
            reason,
        });
        let _ = self.event_tx.send(event).await;
        Ok(())
    }

    fn addrs(&self) -> (String, String) {
        let shared = self.shared.lock();
        (shared.client_addr.clone(), shared.server_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr};

    use crate::stream::reader::DataBlock;

    fn key() -> StreamKey {
        StreamKey::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 9)),
            50000,
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            80,
        )
    }

    async fn feed(data: &[u8]) -> Reader {
        let (tx, reader) = Reader::channel();
        tx.send(DataBlock::copied(data, Utc.timestamp_opt(7, 0).unwrap()))
            .await
            .unwrap();
        drop(tx);
        reader
    }

    #[tokio::test]
    async fn test_request_half_emits_numbered_events() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let pair = Pair::new(3, event_tx, false);
        let reader = feed(
            b"GET /a HTTP/1.1\r\nHost: e.com\r\n\r\n\
              GET /b HTTP/1.1\r\nHost: e.com\r\n\r\n",
        )
        .await;

        pair.run(key(), reader, &MethodFilter::all()).await;
        drop(pair);

        let mut events = Vec::new();
        while let Some(e) = event_rx.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (HttpEvent::Request(a), HttpEvent::Request(b)) => {
                assert_eq!((a.meta.id, b.meta.id), (1, 2));
                assert_eq!(a.uri, "/a");
                assert_eq!(b.uri, "/b");
                assert_eq!(a.meta.stream_seq, 3);
                assert_eq!(a.meta.client_addr, "192.168.0.9:50000");
                assert_eq!(a.meta.server_addr, "93.184.216.34:80");
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_without_request_gets_id_zero() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let pair = Pair::new(0, event_tx, false);
        let reader = feed(b"HTTP/1.1 204 No Content\r\nServer: t\r\n\r\n").await;

        pair.run(key().reversed(), reader, &MethodFilter::all()).await;
        drop(pair);

        let event = event_rx.recv().await.unwrap();
        match event {
            HttpEvent::Response(r) => {
                assert_eq!(r.meta.id, 0);
                assert_eq!(r.code, 204);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_method_filter_suppresses_but_advances() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let pair = Pair::new(0, event_tx, false);
        let reader = feed(
            b"POST /skip HTTP/1.1\r\nHost: e\r\nContent-Length: 2\r\n\r\nhi\
              GET /keep HTTP/1.1\r\nHost: e\r\n\r\n",
        )
        .await;

        pair.run(key(), reader, &MethodFilter::parse("GET")).await;
        drop(pair);

        let mut events = Vec::new();
        while let Some(e) = event_rx.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            HttpEvent::Request(r) => {
                assert_eq!(r.uri, "/keep");
                // The suppressed POST still consumed id 1.
                assert_eq!(r.meta.id, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_only_requests_suppresses_responses() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let pair = Pair::new(0, event_tx, true);
        let reader = feed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

        pair.run(key().reversed(), reader, &MethodFilter::all()).await;
        drop(pair);

        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_ends_loop() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let pair = Pair::new(0, event_tx, false);
        let reader = feed(b"NOT AN HTTP LINE AT ALL\nmore garbage\r\n").await;

        pair.run(key(), reader, &MethodFilter::all()).await;
        drop(pair);

        assert!(event_rx.recv().await.is_none());
    }
}
