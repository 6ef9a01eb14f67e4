//! Packet source adapter
//!
//! Opens the capture input (offline file or live device, with interface
//! auto-selection and BPF filtering) and pumps copied packets from the
//! blocking pcap handle into a bounded channel on a dedicated thread.

use std::net::IpAddr;
use std::path::Path;
use std::thread;

use chrono::{DateTime, TimeZone, Utc};
use pcap::{Activated, Capture, Device};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::CaptureConfig;

/// Bound of the packet channel between the pump thread and the capture loop.
pub const PACKET_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
}

/// One captured packet, copied out of the pcap buffer.
#[derive(Debug, Clone)]
pub struct OwnedPacket {
    pub data: Vec<u8>,
    pub seen: DateTime<Utc>,
}

/// Open the configured input as an offline file or a live device.
pub fn open(config: &CaptureConfig) -> Result<Capture<dyn Activated>, CaptureError> {
    let path = Path::new(&config.input);
    let is_file = std::fs::metadata(path)
        .map(|m| !m.is_dir())
        .unwrap_or(false);

    if is_file {
        info!(file = %config.input, "opening capture file");
        return Ok(Capture::from_file(path)?.into());
    }

    let device = if config.input.is_empty() || config.input == "any" {
        auto_select_device()
    } else {
        config.input.clone()
    };
    info!(device = %device, bpf = %config.bpf, "opening live capture");

    let mut capture = Capture::from_device(device.as_str())?
        .promisc(false)
        .snaplen(config.snap_len)
        .timeout(0)
        .open()?;
    if !config.bpf.is_empty() {
        capture.filter(&config.bpf, true)?;
    }
    Ok(capture.into())
}

/// First interface with a routable-looking address, falling back to `any`.
fn auto_select_device() -> String {
    let Ok(devices) = Device::list() else {
        return "any".to_string();
    };

    for device in devices {
        for address in &device.addresses {
            let ip = address.addr;
            if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() || is_link_local(ip) {
                continue;
            }
            return device.name;
        }
    }
    "any".to_string()
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Pump packets from the blocking handle into the channel.
///
/// Ends (closing the channel) on end-of-file, a fatal read error, or the
/// receiver going away.
pub fn spawn_pump(
    capture: Capture<dyn Activated>,
    tx: mpsc::Sender<OwnedPacket>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut capture = capture;
        loop {
            match capture.next_packet() {
                Ok(packet) => {
                    let owned = OwnedPacket {
                        data: packet.data.to_vec(),
                        seen: timeval_to_datetime(
                            packet.header.ts.tv_sec as i64,
                            packet.header.ts.tv_usec as i64,
                        ),
                    };
                    if tx.blocking_send(owned).is_err() {
                        debug!("packet channel closed, stopping pump");
                        return;
                    }
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => {
                    debug!("capture input exhausted");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "capture read failed");
                    return;
                }
            }
        }
    })
}

fn timeval_to_datetime(sec: i64, usec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(sec, (usec as u32).wrapping_mul(1000))
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
