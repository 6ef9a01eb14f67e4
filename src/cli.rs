use std::path::PathBuf;

use clap::Parser;

use httpscope::capture::CaptureConfig;

#[derive(Parser)]
#[command(name = "httpscope")]
#[command(author, version, about = "Passive HTTP/1.x traffic observer")]
pub struct Cli {
    /// Device to capture, or pcap filename to open
    #[arg(short = 'i', long = "input", default_value = "any")]
    pub input: String,

    /// Berkeley packet filter for live capture
    #[arg(long, default_value = "tcp and dst port 80")]
    pub bpf: String,

    /// Snap length in bytes
    #[arg(long = "snap-len", default_value_t = 65535)]
    pub snap_len: i32,

    /// Event channel capacity
    #[arg(long = "event-size", default_value_t = 1024)]
    pub event_size: usize,

    /// Suppress response events (pass `--only-request false` to keep them)
    #[arg(
        long = "only-request",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub only_request: bool,

    /// Comma-separated allow-list of request methods (empty allows all)
    #[arg(long = "only-method", default_value = "")]
    pub only_method: String,

    /// Mirror captured packets to this pcap file
    #[arg(long = "pcap-out")]
    pub pcap_out: Option<PathBuf>,

    /// Write request/response dumps to this file; "stdout" prints them,
    /// a ":replay" suffix produces replayable output
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    /// Base name for rotating JSON shard files (request events only)
    #[arg(long = "json-out")]
    pub json_out: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            input: self.input.clone(),
            bpf: self.bpf.clone(),
            snap_len: self.snap_len,
            event_capacity: self.event_size,
            only_requests: self.only_request,
            only_method: self.only_method.clone(),
            pcap_out: self.pcap_out.clone(),
        }
    }
}
