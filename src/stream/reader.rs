//! Buffered reads over a half-connection's data blocks
//!
//! The reader is the parser-facing end of one half-connection: the stream
//! half pushes copied data blocks into a bounded channel, the reader pulls
//! them on demand and serves delimiter/length reads from its buffer.
//! Single consumer, no locking.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Bound of the per-half input channel.
pub const READER_QUEUE: usize = 32;

/// An owned copy of one reassembly plus its capture timestamp.
///
/// The copy is mandatory: the reassembler reuses its buffers after the
/// consumer returns.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub bytes: Vec<u8>,
    pub seen: DateTime<Utc>,
}

impl DataBlock {
    pub fn copied(bytes: &[u8], seen: DateTime<Utc>) -> Self {
        Self {
            bytes: bytes.to_vec(),
            seen,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    /// The input channel closed before the read could be satisfied.
    #[error("end of stream")]
    Eof,
}

/// Parser-facing end of one half-connection.
pub struct Reader {
    rx: mpsc::Receiver<DataBlock>,
    buffer: BytesMut,
    last_seen: DateTime<Utc>,
}

impl Reader {
    /// Create a reader together with the sender that feeds it.
    pub fn channel() -> (mpsc::Sender<DataBlock>, Reader) {
        let (tx, rx) = mpsc::channel(READER_QUEUE);
        (
            tx,
            Reader {
                rx,
                buffer: BytesMut::new(),
                last_seen: DateTime::<Utc>::UNIX_EPOCH,
            },
        )
    }

    /// Capture timestamp of the most recently ingested block.
    ///
    /// Monotonically non-decreasing as long as capture timestamps are.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    async fn fill(&mut self) -> Result<(), ReadError> {
        match self.rx.recv().await {
            Some(block) => {
                self.buffer.extend_from_slice(&block.bytes);
                self.last_seen = block.seen;
                Ok(())
            }
            None => Err(ReadError::Eof),
        }
    }

    /// Read all bytes up to and including the first occurrence of `delim`.
    pub async fn read_until(&mut self, delim: &[u8]) -> Result<Vec<u8>, ReadError> {
        loop {
            if let Some(pos) = find(&self.buffer, delim) {
                return Ok(self.buffer.split_to(pos + delim.len()).to_vec());
            }
            self.fill().await?;
        }
    }

    /// Read exactly `n` bytes.
    pub async fn next(&mut self, n: usize) -> Result<Vec<u8>, ReadError> {
        while self.buffer.len() < n {
            self.fill().await?;
        }
        Ok(self.buffer.split_to(n).to_vec())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
