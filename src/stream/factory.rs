//! Pairing of half-connections
//!
//! The factory is the reassembler's consumer factory: every new
//! half-connection gets a stream/reader couple, and the reader is handed to
//! a pair task. A half whose reverse key is already waiting joins that
//! pair; otherwise a fresh pair is created and parked under the half's key
//! until its mate shows up (or never does).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::core::event::HttpEvent;
use crate::core::key::StreamKey;
use crate::reassembly::{ConsumerFactory, StreamConsumer};
use crate::stream::pair::Pair;
use crate::stream::reader::Reader;
use crate::stream::stream::HttpStream;

/// Allow-list over request methods; an empty list allows everything.
#[derive(Debug, Clone, Default)]
pub struct MethodFilter {
    allowed: Option<HashSet<String>>,
}

impl MethodFilter {
    /// Accept every method.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated allow-list such as `"GET,POST"`.
    pub fn parse(list: &str) -> Self {
        if list.is_empty() {
            return Self::all();
        }
        let allowed = list
            .split(',')
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        Self {
            allowed: Some(allowed),
        }
    }

    pub fn allows(&self, method: &str) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(method),
        }
    }
}

/// Builds streams for the reassembler and runs their pair tasks.
pub struct Factory {
    event_tx: mpsc::Sender<HttpEvent>,
    only_requests: bool,
    filter: Arc<MethodFilter>,
    seq: u64,
    waiting: Arc<Mutex<HashMap<StreamKey, Arc<Pair>>>>,
    running: Arc<AtomicI64>,
    tasks: JoinSet<()>,
}

impl Factory {
    pub fn new(event_tx: mpsc::Sender<HttpEvent>, only_requests: bool, only_method: &str) -> Self {
        Self {
            event_tx,
            only_requests,
            filter: Arc::new(MethodFilter::parse(only_method)),
            seq: 0,
            waiting: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicI64::new(0)),
            tasks: JoinSet::new(),
        }
    }

    /// Number of connections whose first half-task is still running.
    pub fn running_streams(&self) -> i64 {
        self.running.load(Ordering::Relaxed)
    }

    /// Block until every spawned pair task has exited.
    pub async fn wait(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

impl ConsumerFactory for Factory {
    fn new_consumer(&mut self, key: StreamKey) -> Box<dyn StreamConsumer> {
        let (block_tx, reader) = Reader::channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stream = HttpStream::new(key, block_tx, stop_rx);
        let filter = self.filter.clone();

        let joining = self.waiting.lock().remove(&key.reversed());
        match joining {
            Some(pair) => {
                // Second half of a known connection.
                self.tasks.spawn(async move {
                    pair.run(key, reader, &filter).await;
                    let _ = stop_tx.send(true);
                });
            }
            None => {
                let pair = Pair::new(self.seq, self.event_tx.clone(), self.only_requests);
                self.seq += 1;
                self.waiting.lock().insert(key, pair.clone());
                self.running.fetch_add(1, Ordering::Relaxed);

                let waiting = self.waiting.clone();
                let running = self.running.clone();
                self.tasks.spawn(async move {
                    pair.run(key, reader, &filter).await;
                    let _ = stop_tx.send(true);
                    waiting.lock().remove(&key);
                    running.fetch_add(-1, Ordering::Relaxed);
                });
            }
        }

        Box::new(stream)
    }
}
