//! Half-connection ingest
//!
//! `HttpStream` is the reassembler-facing end of one half-connection. It
//! copies reassembled byte runs into the reader's bounded channel; a gap,
//! a fired stop signal, or a stalled reader marks the half bad and drops
//! everything further.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::core::key::StreamKey;
use crate::reassembly::{Reassembly, StreamConsumer};
use crate::stream::reader::DataBlock;

/// How long one block send may stall before the half is declared orphaned.
///
/// One-sided captures (request seen, response lost, or the reverse) leave
/// the parser waiting on the other half forever; the timeout breaks that
/// deadlock without a global coordinator.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub struct HttpStream {
    key: StreamKey,
    tx: Option<mpsc::Sender<DataBlock>>,
    stop: watch::Receiver<bool>,
    bytes: u64,
    bad: bool,
}

impl HttpStream {
    pub fn new(key: StreamKey, tx: mpsc::Sender<DataBlock>, stop: watch::Receiver<bool>) -> Self {
        Self {
            key,
            tx: Some(tx),
            stop,
            bytes: 0,
            bad: false,
        }
    }

    /// Total payload bytes accepted on this half.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }
}

#[async_trait]
impl StreamConsumer for HttpStream {
    async fn reassembled(&mut self, rs: &[Reassembly<'_>]) {
        if self.bad {
            return;
        }

        for r in rs {
            if r.skip != 0 {
                debug!(stream = %self.key, skip = r.skip, "gap in stream, dropping half");
                self.bad = true;
                return;
            }
            if r.bytes.is_empty() {
                continue;
            }
            let Some(tx) = &self.tx else {
                return;
            };
            if *self.stop.borrow() {
                self.bad = true;
                return;
            }

            self.bytes += r.bytes.len() as u64;
            let block = DataBlock::copied(r.bytes, r.seen);
            tokio::select! {
                // The parser side quit; stop buffering for it.
                _ = self.stop.changed() => {
                    self.bad = true;
                    return;
                }
                res = tx.send_timeout(block, SEND_TIMEOUT) => {
                    if res.is_err() {
                        debug!(stream = %self.key, "reader stalled, dropping half");
                        self.bad = true;
                        return;
                    }
                }
            }
        }
    }

    fn reassembly_complete(&mut self) {
        // Dropping the sender signals end-of-stream to the reader.
        self.tx = None;
    }
}
