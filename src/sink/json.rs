//! Rotating JSON shard sink
//!
//! Serializes request events as JSON lines. Shards roll over every 1 000
//! records and at least hourly; file names are
//! `{base}.{YYYYMMDDHH}.{seq:04}`. Writing happens on an internal task so
//! the dispatcher only pays a channel send.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error};

use super::EventSink;
use crate::core::event::{HttpEvent, RequestEvent};

/// Records per shard file.
const SHARD_RECORDS: usize = 1000;

/// Queue between the dispatcher and the writer task.
const QUEUE_SIZE: usize = 1000;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Headers omitted from the stored records.
const DROPPED_HEADERS: &[&str] = &[
    "User-Agent",
    "Host",
    "Connection",
    "Transfer-Encoding",
    "Content-Length",
];

#[derive(Debug, Serialize)]
struct RequestRecord {
    time: String,
    method: String,
    uri: String,
    header: BTreeMap<String, String>,
    body: String,
}

impl RequestRecord {
    fn from_event(event: &RequestEvent) -> Self {
        let mut header = BTreeMap::new();
        for h in event.meta.headers.iter() {
            if DROPPED_HEADERS.iter().any(|d| h.name.eq_ignore_ascii_case(d)) {
                continue;
            }
            // First value wins, keyed by first-seen casing.
            if !header.keys().any(|k: &String| k.eq_ignore_ascii_case(&h.name)) {
                header.insert(h.name.clone(), h.value.clone());
            }
        }
        Self {
            time: event.meta.start.format(TIME_FORMAT).to_string(),
            method: event.method.clone(),
            uri: event.uri.clone(),
            header,
            body: String::from_utf8_lossy(&event.meta.body).into_owned(),
        }
    }
}

pub struct EventJsonWriter {
    tx: Option<mpsc::Sender<RequestEvent>>,
    task: Option<JoinHandle<()>>,
}

impl EventJsonWriter {
    pub fn new(base: &str) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let task = tokio::spawn(writer_loop(base.to_string(), rx));
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }
}

#[async_trait]
impl EventSink for EventJsonWriter {
    async fn push_event(&mut self, event: &HttpEvent) {
        if let (HttpEvent::Request(request), Some(tx)) = (event, &self.tx) {
            let _ = tx.send(request.clone()).await;
        }
    }

    async fn wait(&mut self) {
        // Closing the queue lets the writer drain and exit.
        self.tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn writer_loop(base: String, mut rx: mpsc::Receiver<RequestEvent>) {
    let mut seq: u32 = 0;
    let mut shard: Option<BufWriter<File>> = None;
    let mut count = 0usize;

    let mut rollover = interval(Duration::from_secs(3600));
    rollover.set_missed_tick_behavior(MissedTickBehavior::Delay);
    rollover.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                None => break,
                Some(event) => {
                    if shard.is_none() {
                        match open_shard(&base, &mut seq) {
                            Ok(out) => shard = Some(out),
                            Err(e) => {
                                error!(error = %e, "cannot open json shard");
                                continue;
                            }
                        }
                    }
                    let Some(out) = shard.as_mut() else { continue };
                    if let Err(e) = write_record(out, &event) {
                        debug!(error = %e, "writing json record failed");
                    }
                    count += 1;
                    if count >= SHARD_RECORDS {
                        close_shard(&mut shard);
                        count = 0;
                    }
                }
            },
            _ = rollover.tick() => {
                if count > 0 {
                    close_shard(&mut shard);
                    count = 0;
                }
            }
        }
    }
    close_shard(&mut shard);
}

fn write_record(out: &mut BufWriter<File>, event: &RequestEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, &RequestRecord::from_event(event))?;
    out.write_all(b"\n")
}

fn open_shard(base: &str, seq: &mut u32) -> std::io::Result<BufWriter<File>> {
    loop {
        *seq += 1;
        let name = format!("{}.{}.{:04}", base, Utc::now().format("%Y%m%d%H"), seq);
        if Path::new(&name).exists() {
            continue;
        }
        let file = OpenOptions::new().create(true).append(true).open(name)?;
        return Ok(BufWriter::new(file));
    }
}

fn close_shard(shard: &mut Option<BufWriter<File>>) {
    if let Some(mut out) = shard.take() {
        let _ = out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::core::event::EventMeta;
    use crate::core::headers::HeaderMap;

    fn request(uri: &str) -> HttpEvent {
        let mut headers = HeaderMap::new();
        headers.append("Host", "example.com");
        headers.append("X-Trace", "abc");
        HttpEvent::Request(RequestEvent {
            meta: EventMeta {
                start: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                end: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                stream_seq: 0,
                id: 1,
                client_addr: "1.1.1.1:1".into(),
                server_addr: "2.2.2.2:80".into(),
                headers,
                body: b"{\"a\":1}".to_vec(),
            },
            method: "POST".into(),
            uri: uri.into(),
            version: "HTTP/1.1".into(),
        })
    }

    fn shard_files(base: &str) -> Vec<std::path::PathBuf> {
        let dir = Path::new(base).parent().unwrap();
        let prefix = Path::new(base).file_name().unwrap().to_str().unwrap();
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_writes_request_records_as_json_lines() {
        let base = std::env::temp_dir()
            .join(format!("httpscope-json-{}", std::process::id()))
            .to_str()
            .unwrap()
            .to_string();

        let mut sink = EventJsonWriter::new(&base);
        sink.push_event(&request("/a")).await;
        sink.push_event(&request("/b")).await;
        sink.wait().await;

        let files = shard_files(&base);
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(&files[0]).unwrap();
        for f in files {
            std::fs::remove_file(f).ok();
        }

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["method"], "POST");
        assert_eq!(first["uri"], "/a");
        assert_eq!(first["body"], "{\"a\":1}");
        assert_eq!(first["time"], "2023-11-14 22:13:20.000");
        // Hop-by-hop headers are dropped, the rest preserved.
        assert!(first["header"].get("Host").is_none());
        assert_eq!(first["header"]["X-Trace"], "abc");
    }
}
