//! Stream identity
//!
//! A `StreamKey` names one half of a TCP connection. The two halves of a
//! connection carry keys that are each other's reverse.

use std::fmt;
use std::net::IpAddr;

/// Directional key for one half of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl StreamKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// Key of the opposite half of the same connection.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    /// `ip:port` of the sending side of this half.
    pub fn src_addr(&self) -> String {
        format!("{}:{}", self.src_ip, self.src_port)
    }

    /// `ip:port` of the receiving side of this half.
    pub fn dst_addr(&self) -> String {
        format!("{}:{}", self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> StreamKey {
        StreamKey::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            54321,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            80,
        )
    }

    #[test]
    fn test_reversed_is_involution() {
        let k = key();
        let r = k.reversed();
        assert_ne!(k, r);
        assert_eq!(k, r.reversed());
        assert_eq!(r.src_port, 80);
        assert_eq!(r.dst_port, 54321);
    }

    #[test]
    fn test_addresses() {
        let k = key();
        assert_eq!(k.src_addr(), "192.168.1.100:54321");
        assert_eq!(k.dst_addr(), "10.0.0.1:80");
        assert_eq!(k.to_string(), "192.168.1.100:54321 -> 10.0.0.1:80");
    }
}
