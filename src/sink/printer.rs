//! Textual dump sink
//!
//! Writes request/response records to a file or stdout. The plain format is
//! bit-stable; a `:replay` suffix on the target switches to a replayable
//! request-only format that drops hop-by-hop headers.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};

use async_trait::async_trait;
use tracing::debug;

use super::EventSink;
use crate::core::event::{HttpEvent, RequestEvent, ResponseEvent};
use crate::core::headers::HeaderMap;

const REPLAY_SUFFIX: &str = ":replay";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Headers that must not survive into replayable dumps.
const REPLAY_DROPPED: &[&str] = &["User-Agent", "Host", "Connection", "Transfer-Encoding"];

pub struct EventPrinter {
    out: Box<dyn Write + Send>,
    replay: bool,
}

impl EventPrinter {
    /// Open `target` for writing. `stdout` selects standard output; a
    /// trailing `:replay` selects the replayable format.
    pub fn create(target: &str) -> io::Result<Self> {
        let (name, replay) = match target.strip_suffix(REPLAY_SUFFIX) {
            Some(name) => (name, true),
            None => (target, false),
        };

        let out: Box<dyn Write + Send> = if name == "stdout" {
            Box::new(io::stdout())
        } else {
            let file = OpenOptions::new().create(true).write(true).open(name)?;
            Box::new(BufWriter::new(file))
        };
        Ok(Self { out, replay })
    }
}

#[async_trait]
impl EventSink for EventPrinter {
    async fn push_event(&mut self, event: &HttpEvent) {
        let record = match event {
            HttpEvent::Request(r) => format_request(r, self.replay),
            HttpEvent::Response(r) => format_response(r, self.replay),
        };
        if let Err(e) = self.out.write_all(&record) {
            debug!(error = %e, "writing dump record failed");
        }
    }

    async fn wait(&mut self) {
        let _ = self.out.flush();
    }
}

/// Render one request record; deterministic for identical events.
pub fn format_request(r: &RequestEvent, replay: bool) -> Vec<u8> {
    let mut b = Vec::new();
    if replay {
        let _ = write!(b, "###\r\n{} {}\r\n", r.method, r.uri);
        for h in r.meta.headers.iter() {
            if REPLAY_DROPPED.iter().any(|d| h.name.eq_ignore_ascii_case(d)) {
                continue;
            }
            let _ = write!(b, "{}: {}\r\n", h.name, h.value);
        }
        let _ = write!(b, "\r\n");
        if !r.meta.body.is_empty() {
            b.extend_from_slice(&r.meta.body);
            let _ = write!(b, "\r\n\r\n");
        }
        return b;
    }

    let _ = write!(
        b,
        "#{} [{}] Request {}->{}\r\n",
        r.meta.stream_seq,
        r.meta.start.format(TIME_FORMAT),
        r.meta.client_addr,
        r.meta.server_addr
    );
    let _ = write!(b, "{} {} {}\r\n", r.method, r.uri, r.version);
    write_headers(&mut b, &r.meta.headers);
    write_body(&mut b, &r.meta.body);
    b
}

/// Render one response record; replay mode emits nothing for responses.
pub fn format_response(r: &ResponseEvent, replay: bool) -> Vec<u8> {
    if replay {
        return Vec::new();
    }

    let mut b = Vec::new();
    let _ = write!(
        b,
        "#{} [{}] Response {}<-{}\r\n",
        r.meta.stream_seq,
        r.meta.start.format(TIME_FORMAT),
        r.meta.client_addr,
        r.meta.server_addr
    );
    let _ = write!(b, "{} {} {}\r\n", r.version, r.code, r.reason);
    write_headers(&mut b, &r.meta.headers);
    write_body(&mut b, &r.meta.body);
    b
}

fn write_headers(b: &mut Vec<u8>, headers: &HeaderMap) {
    for h in headers.iter() {
        let _ = write!(b, "{}: {}\r\n", h.name, h.value);
    }
}

fn write_body(b: &mut Vec<u8>, body: &[u8]) {
    if !body.is_empty() {
        let _ = write!(b, "\r\ncontent({})", body.len());
        b.extend_from_slice(body);
    }
    let _ = write!(b, "\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::core::event::EventMeta;

    fn sample_request() -> RequestEvent {
        let mut headers = HeaderMap::new();
        headers.append("Host", "example.com");
        headers.append("User-Agent", "curl/8.0");
        headers.append("Accept", "*/*");

        RequestEvent {
            meta: EventMeta {
                start: Utc.timestamp_opt(1_700_000_000, 123_000_000).unwrap(),
                end: Utc.timestamp_opt(1_700_000_000, 456_000_000).unwrap(),
                stream_seq: 7,
                id: 1,
                client_addr: "192.168.0.9:50000".into(),
                server_addr: "93.184.216.34:80".into(),
                headers,
                body: b"hello".to_vec(),
            },
            method: "POST".into(),
            uri: "/submit".into(),
            version: "HTTP/1.1".into(),
        }
    }

    #[test]
    fn test_request_dump_is_bit_stable() {
        let request = sample_request();
        let expected = b"#7 [2023-11-14 22:13:20.123] Request 192.168.0.9:50000->93.184.216.34:80\r\n\
                         POST /submit HTTP/1.1\r\n\
                         Host: example.com\r\n\
                         User-Agent: curl/8.0\r\n\
                         Accept: */*\r\n\
                         \r\ncontent(5)hello\r\n\r\n";
        assert_eq!(format_request(&request, false), expected.to_vec());
        // Same input, same bytes.
        assert_eq!(format_request(&request, false), format_request(&request, false));
    }

    #[test]
    fn test_empty_body_has_no_content_section() {
        let mut request = sample_request();
        request.meta.body.clear();
        let text = String::from_utf8(format_request(&request, false)).unwrap();
        assert!(!text.contains("content("));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_replay_request_drops_hop_by_hop_headers() {
        let request = sample_request();
        let text = String::from_utf8(format_request(&request, true)).unwrap();
        assert!(text.starts_with("###\r\nPOST /submit\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.contains("Host:"));
        assert!(!text.contains("User-Agent:"));
        assert!(text.ends_with("\r\nhello\r\n\r\n"));
    }

    #[test]
    fn test_response_dump_format() {
        let request = sample_request();
        let response = ResponseEvent {
            meta: EventMeta {
                body: b"ok".to_vec(),
                ..request.meta.clone()
            },
            version: "HTTP/1.1".into(),
            code: 200,
            reason: "OK".into(),
        };
        let text = String::from_utf8(format_response(&response, false)).unwrap();
        assert!(text.starts_with(
            "#7 [2023-11-14 22:13:20.123] Response 192.168.0.9:50000<-93.184.216.34:80\r\n"
        ));
        assert!(text.contains("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("\r\ncontent(2)ok\r\n\r\n"));

        // Replay mode suppresses responses entirely.
        assert!(format_response(&response, true).is_empty());
    }
}
