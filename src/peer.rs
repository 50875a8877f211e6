//! # Peer Records
//!
//! Peers are discovered through tracker communication. The tracker responds
//! with a compact binary list of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

/// Size of one compact peer entry in bytes.
const PEER_SIZE: usize = 6;

/// Errors produced while parsing peer records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peers: invalid compact peer entry of {0} bytes, expected a multiple of {PEER_SIZE}")]
    Parse(usize),
    #[error("peers: invalid peer address `{0}`")]
    ParseAddr(String),
}

/// A remote peer in the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer { ip, port }
    }

    /// The peer's socket address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Peer {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Peer, PeerError> {
        let (ip, port) = s
            .split_once(':')
            .ok_or_else(|| PeerError::ParseAddr(s.to_string()))?;
        let ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|_| PeerError::ParseAddr(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| PeerError::ParseAddr(s.to_string()))?;
        Ok(Peer::new(ip, port))
    }
}

/// Parse a compact peer list received from the tracker.
///
/// # Arguments
///
/// * `data` - Concatenated 6-byte peer entries.
///
pub fn from_compact(data: &[u8]) -> Result<Vec<Peer>, PeerError> {
    // Check tracker peers are valid
    if data.len() % PEER_SIZE != 0 {
        return Err(PeerError::Parse(data.len()));
    }

    let mut peers = Vec::with_capacity(data.len() / PEER_SIZE);
    for entry in data.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor
            .read_u16::<BigEndian>()
            .map_err(|_| PeerError::Parse(data.len()))?;
        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_entry() {
        let peers = from_compact(&[0x0a, 0x00, 0x00, 0x01, 0x1a, 0xe1]).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].to_string(), "10.0.0.1:6881");
    }

    #[test]
    fn decodes_multiple_entries_with_big_endian_ports() {
        let buf: Vec<u8> = vec![
            192, 168, 1, 1, 0x00, 0x50, // 192.168.1.1:80
            127, 0, 0, 1, 0x1f, 0x90, // 127.0.0.1:8080
        ];
        let peers = from_compact(&buf).unwrap();
        assert_eq!(peers.len(), 2);
        for (i, peer) in peers.iter().enumerate() {
            let expected = 256 * buf[6 * i + 4] as u16 + buf[6 * i + 5] as u16;
            assert_eq!(peer.port, expected);
        }
    }

    #[test]
    fn rejects_truncated_list() {
        assert_eq!(
            from_compact(&[10, 0, 0, 1, 0x1a]),
            Err(PeerError::Parse(5))
        );
    }

    #[test]
    fn parses_addr_strings() {
        let peer: Peer = "10.1.2.3:51413".parse().unwrap();
        assert_eq!(peer.ip, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(peer.port, 51413);
        assert!("10.1.2.3".parse::<Peer>().is_err());
        assert!("host:80".parse::<Peer>().is_err());
    }
}
