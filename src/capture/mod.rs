//! Packet capture
//!
//! - `source`: opens the live device or capture file and pumps packets
//! - `mirror`: optional pcap copy of every captured TCP packet
//! - `run`: the capture loop driving packets into the reassembler

pub mod mirror;
pub mod run;
pub mod source;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use mirror::PcapMirror;
pub use run::run;
pub use source::{open, spawn_pump, CaptureError, OwnedPacket};

/// Capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device name to capture on, or path to a capture file.
    pub input: String,
    /// BPF filter applied to live captures.
    pub bpf: String,
    /// Snap length in bytes.
    pub snap_len: i32,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Suppress response events.
    pub only_requests: bool,
    /// Comma-separated request method allow-list; empty allows all.
    pub only_method: String,
    /// Mirror captured packets to this pcap file.
    pub pcap_out: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input: "any".to_string(),
            bpf: "tcp and dst port 80".to_string(),
            snap_len: 65535,
            event_capacity: 1024,
            only_requests: true,
            only_method: String::new(),
            pcap_out: None,
        }
    }
}
