//! Capture loop
//!
//! Single producer for the whole pipeline: consumes captured packets,
//! keeps only TCP, mirrors them when asked, and feeds the reassembler.
//! Stale flows are flushed on a capture-time cutoff so stuck
//! half-connections cannot pin their pair tasks forever.

use std::net::IpAddr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use super::{CaptureConfig, OwnedPacket, PcapMirror};
use crate::core::event::HttpEvent;
use crate::core::key::StreamKey;
use crate::reassembly::{Assembler, TcpSegment};
use crate::stream::Factory;

/// How often stale flows are flushed.
const FLUSH_TICK: Duration = Duration::from_secs(5);

/// Flows idle longer than this (in capture time) are flushed.
const FLUSH_AGE_SECS: i64 = 10;

/// Drive the packet channel to exhaustion.
///
/// Returns the number of TCP packets handed to the reassembler. When the
/// channel closes, all reassembler state is flushed, every pair task is
/// awaited, and dropping the factory closes the event channel.
pub async fn run(
    mut packets: mpsc::Receiver<OwnedPacket>,
    event_tx: mpsc::Sender<HttpEvent>,
    config: CaptureConfig,
    mut mirror: Option<PcapMirror>,
) -> u64 {
    let factory = Factory::new(event_tx, config.only_requests, &config.only_method);
    let mut assembler = Assembler::new(factory);

    let mut tick = interval(FLUSH_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_seen: Option<DateTime<Utc>> = None;
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            packet = packets.recv() => match packet {
                None => break,
                Some(packet) => {
                    if let Some(seen) =
                        process_packet(&mut assembler, mirror.as_mut(), &packet).await
                    {
                        last_seen = Some(seen);
                        count += 1;
                    }
                }
            },
            _ = tick.tick() => {
                if let Some(seen) = last_seen {
                    let cutoff = seen - ChronoDuration::seconds(FLUSH_AGE_SECS);
                    assembler.flush_older_than(cutoff).await;
                }
            }
        }
    }

    assembler.flush_all().await;
    info!(packets = count, "capture input drained");
    assembler.factory_mut().wait().await;

    if let Some(mirror) = mirror.as_mut() {
        if let Err(e) = mirror.flush() {
            warn!(error = %e, "flushing pcap mirror failed");
        }
    }
    info!("parse complete");
    count
}

/// Decode one packet and hand its TCP segment to the reassembler.
///
/// Returns the capture timestamp for accepted packets, `None` for packets
/// without an IP or TCP layer.
async fn process_packet(
    assembler: &mut Assembler<Factory>,
    mirror: Option<&mut PcapMirror>,
    packet: &OwnedPacket,
) -> Option<DateTime<Utc>> {
    let sliced = SlicedPacket::from_ethernet(&packet.data).ok()?;

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => (
            IpAddr::from(v4.header().source_addr()),
            IpAddr::from(v4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(v6)) => (
            IpAddr::from(v6.header().source_addr()),
            IpAddr::from(v6.header().destination_addr()),
        ),
        _ => return None,
    };
    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return None;
    };

    if let Some(mirror) = mirror {
        if let Err(e) = mirror.write_packet(packet.seen, &packet.data) {
            warn!(error = %e, "pcap mirror write failed");
        }
    }

    let key = StreamKey::new(src_ip, tcp.source_port(), dst_ip, tcp.destination_port());
    let segment = TcpSegment {
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload(),
    };
    assembler.assemble(key, segment, packet.seen).await;
    Some(packet.seen)
}
