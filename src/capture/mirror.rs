//! Pcap mirror writer
//!
//! Writes accepted packets to a standard pcap file: version 2.4 global
//! header, Ethernet link type, the configured snap length, microsecond
//! record timestamps. Written directly so the header carries the exact
//! snap length the capture was opened with.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const LINKTYPE_ETHERNET: u32 = 1;

pub struct PcapMirror {
    out: BufWriter<File>,
    snap_len: u32,
    packets: u64,
}

impl PcapMirror {
    pub fn create(path: &Path, snap_len: u32) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&PCAP_MAGIC.to_le_bytes())?;
        out.write_all(&VERSION_MAJOR.to_le_bytes())?;
        out.write_all(&VERSION_MINOR.to_le_bytes())?;
        out.write_all(&0i32.to_le_bytes())?; // thiszone
        out.write_all(&0u32.to_le_bytes())?; // sigfigs
        out.write_all(&snap_len.to_le_bytes())?;
        out.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;
        Ok(Self {
            out,
            snap_len,
            packets: 0,
        })
    }

    pub fn write_packet(&mut self, seen: DateTime<Utc>, data: &[u8]) -> io::Result<()> {
        let included = data.len().min(self.snap_len as usize);
        self.out.write_all(&(seen.timestamp() as u32).to_le_bytes())?;
        self.out
            .write_all(&seen.timestamp_subsec_micros().to_le_bytes())?;
        self.out.write_all(&(included as u32).to_le_bytes())?;
        self.out.write_all(&(data.len() as u32).to_le_bytes())?;
        self.out.write_all(&data[..included])?;
        self.packets += 1;
        Ok(())
    }

    /// Packets written so far.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("httpscope-mirror-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_header_and_record_layout() {
        let path = scratch_path("layout.pcap");
        let seen = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();

        let mut mirror = PcapMirror::create(&path, 65535).unwrap();
        mirror.write_packet(seen, b"abcdef").unwrap();
        mirror.flush().unwrap();
        assert_eq!(mirror.packets(), 1);
        drop(mirror);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(bytes.len(), 24 + 16 + 6);
        assert_eq!(&bytes[0..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..6], &2u16.to_le_bytes());
        assert_eq!(&bytes[6..8], &4u16.to_le_bytes());
        assert_eq!(&bytes[16..20], &65535u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());

        // Record header: ts_sec, ts_usec, incl_len, orig_len.
        assert_eq!(&bytes[24..28], &1_700_000_000u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &123_456u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &6u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &6u32.to_le_bytes());
        assert_eq!(&bytes[40..], b"abcdef");
    }

    #[test]
    fn test_records_truncated_to_snap_length() {
        let path = scratch_path("snap.pcap");
        let seen = Utc.timestamp_opt(1, 0).unwrap();

        let mut mirror = PcapMirror::create(&path, 4).unwrap();
        mirror.write_packet(seen, b"longer than snap").unwrap();
        mirror.flush().unwrap();
        drop(mirror);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(bytes.len(), 24 + 16 + 4);
        assert_eq!(&bytes[32..36], &4u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &16u32.to_le_bytes());
        assert_eq!(&bytes[40..], b"long");
    }
}
