//! TCP stream reassembly
//!
//! Orders captured TCP segments into per-half-connection byte streams.
//! Consumers receive in-order byte runs; a non-zero `skip` marks bytes lost
//! to a gap the buffers could not bridge, after which HTTP framing on that
//! half is unrecoverable. Stale halves are flushed on capture-time cutoffs
//! so their consumers observe end-of-stream.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::core::key::StreamKey;

/// Maximum bytes buffered out of order per half-connection.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Maximum forward gap in sequence numbers to buffer across.
const MAX_SEQ_GAP: u32 = 65535;

/// One contiguous run of reassembled bytes.
///
/// `skip != 0` reports a gap of that many bytes before `bytes`. The slice
/// borrows the assembler's working storage; consumers must copy what they
/// keep.
#[derive(Debug)]
pub struct Reassembly<'a> {
    pub bytes: &'a [u8],
    pub skip: i64,
    pub seen: DateTime<Utc>,
}

/// Receiver of one half-connection's reassembled byte stream.
#[async_trait]
pub trait StreamConsumer: Send {
    async fn reassembled(&mut self, rs: &[Reassembly<'_>]);
    fn reassembly_complete(&mut self);
}

/// Creates a consumer when the assembler first sees a half-connection.
pub trait ConsumerFactory: Send {
    fn new_consumer(&mut self, key: StreamKey) -> Box<dyn StreamConsumer>;
}

/// The fields of one captured TCP segment the assembler cares about.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

struct HalfConn {
    consumer: Box<dyn StreamConsumer>,
    synced: bool,
    isn: u32,
    /// Next expected offset relative to `isn`.
    next_rel: u32,
    /// Out-of-order segments keyed by relative offset.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    fin_seen: bool,
    closed: bool,
    last_seen: DateTime<Utc>,
}

impl HalfConn {
    fn new(consumer: Box<dyn StreamConsumer>, seen: DateTime<Utc>) -> Self {
        Self {
            consumer,
            synced: false,
            isn: 0,
            next_rel: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            fin_seen: false,
            closed: false,
            last_seen: seen,
        }
    }

    /// Deliver buffered segments that became contiguous, trimming overlap.
    async fn drain_pending(&mut self, seen: DateTime<Utc>) {
        loop {
            let Some((&rel, _)) = self.pending.first_key_value() else {
                break;
            };
            if seq_after(rel, self.next_rel) {
                break;
            }
            let bytes = self.pending.remove(&rel).unwrap();
            self.pending_bytes -= bytes.len();
            let end = rel.wrapping_add(bytes.len() as u32);
            if seq_after(end, self.next_rel) {
                let off = self.next_rel.wrapping_sub(rel) as usize;
                self.next_rel = end;
                self.consumer
                    .reassembled(&[Reassembly {
                        bytes: &bytes[off..],
                        skip: 0,
                        seen,
                    }])
                    .await;
            }
            // Entirely old segments are dropped.
        }
    }

    fn complete_if_finished(&mut self) {
        if self.fin_seen && self.pending.is_empty() && !self.closed {
            self.closed = true;
            self.consumer.reassembly_complete();
        }
    }

    /// Deliver whatever is buffered (reporting gaps) and end the stream.
    async fn flush(&mut self) {
        if self.closed {
            return;
        }
        let seen = self.last_seen;
        while let Some((&rel, _)) = self.pending.first_key_value() {
            let bytes = self.pending.remove(&rel).unwrap();
            self.pending_bytes -= bytes.len();
            let gap = rel.wrapping_sub(self.next_rel);
            self.next_rel = rel.wrapping_add(bytes.len() as u32);
            self.consumer
                .reassembled(&[Reassembly {
                    bytes: &bytes[..],
                    skip: gap as i64,
                    seen,
                }])
                .await;
        }
        self.closed = true;
        self.consumer.reassembly_complete();
    }
}

/// Reassembles TCP segments into per-half byte streams.
pub struct Assembler<F: ConsumerFactory> {
    factory: F,
    conns: HashMap<StreamKey, HalfConn>,
}

impl<F: ConsumerFactory> Assembler<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            conns: HashMap::new(),
        }
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// Number of half-connections currently tracked.
    pub fn half_connections(&self) -> usize {
        self.conns.len()
    }

    /// Feed one captured segment.
    pub async fn assemble(&mut self, key: StreamKey, seg: TcpSegment<'_>, seen: DateTime<Utc>) {
        let Self { factory, conns } = self;
        let half = conns
            .entry(key)
            .or_insert_with(|| HalfConn::new(factory.new_consumer(key), seen));
        half.last_seen = seen;
        if half.closed {
            return;
        }

        if seg.rst {
            half.pending.clear();
            half.pending_bytes = 0;
            half.closed = true;
            half.consumer.reassembly_complete();
            return;
        }

        if seg.syn {
            if !half.synced {
                // SYN consumes one sequence number.
                half.isn = seg.seq;
                half.next_rel = 1;
                half.synced = true;
            }
        } else if !half.synced {
            // Mid-stream pickup: sync to the first seen sequence.
            half.isn = seg.seq;
            half.next_rel = 0;
            half.synced = true;
        }

        if !seg.payload.is_empty() {
            let rel = seg.seq.wrapping_sub(half.isn);
            let end = rel.wrapping_add(seg.payload.len() as u32);
            if !seq_after(rel, half.next_rel) {
                // Starts at or before the expected offset.
                if seq_after(end, half.next_rel) {
                    let off = half.next_rel.wrapping_sub(rel) as usize;
                    half.next_rel = end;
                    half.consumer
                        .reassembled(&[Reassembly {
                            bytes: &seg.payload[off..],
                            skip: 0,
                            seen,
                        }])
                        .await;
                    half.drain_pending(seen).await;
                }
                // Else retransmission of old data, dropped.
            } else {
                let gap = rel.wrapping_sub(half.next_rel);
                if gap <= MAX_SEQ_GAP
                    && half.pending_bytes + seg.payload.len() <= MAX_BUFFERED_BYTES
                {
                    if let Some(old) = half.pending.insert(rel, seg.payload.to_vec()) {
                        half.pending_bytes -= old.len();
                    }
                    half.pending_bytes += seg.payload.len();
                } else {
                    // Buffers exhausted; the gap is unrecoverable.
                    trace!(stream = %key, gap, "sequence gap exceeds buffering limits");
                    half.pending.clear();
                    half.pending_bytes = 0;
                    half.next_rel = end;
                    half.consumer
                        .reassembled(&[Reassembly {
                            bytes: seg.payload,
                            skip: gap as i64,
                            seen,
                        }])
                        .await;
                }
            }
        }

        if seg.fin {
            half.fin_seen = true;
        }
        half.complete_if_finished();
    }

    /// Flush half-connections whose last activity predates `cutoff`.
    pub async fn flush_older_than(&mut self, cutoff: DateTime<Utc>) {
        let stale: Vec<StreamKey> = self
            .conns
            .iter()
            .filter(|(_, h)| h.last_seen < cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(mut half) = self.conns.remove(&key) {
                half.flush().await;
            }
        }
    }

    /// Flush every tracked half-connection.
    pub async fn flush_all(&mut self) {
        let keys: Vec<StreamKey> = self.conns.keys().copied().collect();
        for key in keys {
            if let Some(mut half) = self.conns.remove(&key) {
                half.flush().await;
            }
        }
    }
}

/// True when sequence `a` comes before `b`, wraparound-safe.
fn seq_before(a: u32, b: u32) -> bool {
    let diff = b.wrapping_sub(a);
    diff > 0 && diff < (1 << 31)
}

fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recording {
        chunks: Vec<(Vec<u8>, i64)>,
        complete: bool,
    }

    impl Recording {
        fn data(&self) -> Vec<u8> {
            self.chunks.iter().flat_map(|(b, _)| b.clone()).collect()
        }

        fn max_skip(&self) -> i64 {
            self.chunks.iter().map(|(_, s)| *s).max().unwrap_or(0)
        }
    }

    type Shared = Arc<Mutex<Recording>>;

    struct RecordingConsumer(Shared);

    #[async_trait]
    impl StreamConsumer for RecordingConsumer {
        async fn reassembled(&mut self, rs: &[Reassembly<'_>]) {
            let mut rec = self.0.lock();
            for r in rs {
                rec.chunks.push((r.bytes.to_vec(), r.skip));
            }
        }

        fn reassembly_complete(&mut self) {
            self.0.lock().complete = true;
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        streams: Arc<Mutex<HashMap<StreamKey, Shared>>>,
    }

    impl ConsumerFactory for RecordingFactory {
        fn new_consumer(&mut self, key: StreamKey) -> Box<dyn StreamConsumer> {
            let shared = Shared::default();
            self.streams.lock().insert(key, shared.clone());
            Box::new(RecordingConsumer(shared))
        }
    }

    fn test_key() -> StreamKey {
        StreamKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            40000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            80,
        )
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn data_seg(seq: u32, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            seq,
            syn: false,
            fin: false,
            rst: false,
            payload,
        }
    }

    fn flag_seg(seq: u32, syn: bool, fin: bool, rst: bool) -> TcpSegment<'static> {
        TcpSegment {
            seq,
            syn,
            fin,
            rst,
            payload: &[],
        }
    }

    fn new_assembler() -> (Assembler<RecordingFactory>, Arc<Mutex<HashMap<StreamKey, Shared>>>) {
        let factory = RecordingFactory::default();
        let streams = factory.streams.clone();
        (Assembler::new(factory), streams)
    }

    fn recorded(streams: &Arc<Mutex<HashMap<StreamKey, Shared>>>, key: StreamKey) -> Shared {
        streams.lock().get(&key).unwrap().clone()
    }

    #[tokio::test]
    async fn test_in_order_delivery_after_syn() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, flag_seg(1000, true, false, false), ts(1)).await;
        asm.assemble(key, data_seg(1001, b"hello "), ts(2)).await;
        asm.assemble(key, data_seg(1007, b"world"), ts(3)).await;

        let rec = recorded(&streams, key);
        assert_eq!(rec.lock().data(), b"hello world");
        assert_eq!(rec.lock().max_skip(), 0);
        assert!(!rec.lock().complete);
    }

    #[tokio::test]
    async fn test_out_of_order_segments_reordered() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"abc"), ts(1)).await;
        asm.assemble(key, data_seg(106, b"ghi"), ts(2)).await;
        asm.assemble(key, data_seg(103, b"def"), ts(3)).await;

        let rec = recorded(&streams, key);
        assert_eq!(rec.lock().data(), b"abcdefghi");
        assert_eq!(rec.lock().max_skip(), 0);
    }

    #[tokio::test]
    async fn test_retransmission_and_overlap_trimmed() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"abcdef"), ts(1)).await;
        // Full retransmission.
        asm.assemble(key, data_seg(100, b"abcdef"), ts(2)).await;
        // Overlapping tail carrying new bytes.
        asm.assemble(key, data_seg(103, b"defghi"), ts(3)).await;

        let rec = recorded(&streams, key);
        assert_eq!(rec.lock().data(), b"abcdefghi");
    }

    #[tokio::test]
    async fn test_fin_completes_stream() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"bye"), ts(1)).await;
        asm.assemble(key, flag_seg(103, false, true, false), ts(2)).await;

        let rec = recorded(&streams, key);
        assert!(rec.lock().complete);
        assert_eq!(asm.half_connections(), 1);

        // Post-FIN data is ignored.
        asm.assemble(key, data_seg(103, b"late"), ts(3)).await;
        assert_eq!(rec.lock().data(), b"bye");
    }

    #[tokio::test]
    async fn test_rst_completes_and_drops_pending() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"abc"), ts(1)).await;
        asm.assemble(key, data_seg(110, b"future"), ts(2)).await;
        asm.assemble(key, flag_seg(103, false, false, true), ts(3)).await;

        let rec = recorded(&streams, key);
        assert!(rec.lock().complete);
        assert_eq!(rec.lock().data(), b"abc");
    }

    #[tokio::test]
    async fn test_flush_reports_gap() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"abc"), ts(1)).await;
        // Missing [103, 110); this segment stays buffered.
        asm.assemble(key, data_seg(110, b"jkl"), ts(2)).await;
        asm.flush_older_than(ts(100)).await;

        let rec = recorded(&streams, key);
        let rec = rec.lock();
        assert!(rec.complete);
        assert_eq!(rec.max_skip(), 7);
        assert_eq!(asm.half_connections(), 0);
    }

    #[tokio::test]
    async fn test_flush_older_than_spares_active_flows() {
        let (mut asm, streams) = new_assembler();
        let old_key = test_key();
        let live_key = old_key.reversed();

        asm.assemble(old_key, data_seg(100, b"old"), ts(1)).await;
        asm.assemble(live_key, data_seg(500, b"live"), ts(50)).await;
        asm.flush_older_than(ts(10)).await;

        assert!(recorded(&streams, old_key).lock().complete);
        assert!(!recorded(&streams, live_key).lock().complete);
        assert_eq!(asm.half_connections(), 1);
    }

    #[tokio::test]
    async fn test_flush_all_completes_everything() {
        let (mut asm, streams) = new_assembler();
        let key = test_key();

        asm.assemble(key, data_seg(100, b"abc"), ts(1)).await;
        asm.flush_all().await;

        assert!(recorded(&streams, key).lock().complete);
        assert_eq!(asm.half_connections(), 0);
    }
}
