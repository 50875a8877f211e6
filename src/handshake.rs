//! # BitTorrent Handshake
//!
//! The handshake is a fixed 68-byte frame sent immediately after the TCP
//! connection is established, in both directions:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - always 19
//! - **pstr**: 19 bytes - the string "BitTorrent protocol"
//! - **reserved**: 8 bytes - all zeros (extension bits, unused here)
//! - **info_hash**: 20 bytes - raw SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes - unique identifier of the sending peer
//!
//! The info-hash keeps peers from joining the wrong swarm: a mismatch in the
//! reply means the connection must be dropped.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::torrent::SHA1_HASH_SIZE;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake frame in bytes.
pub const HANDSHAKE_SIZE: usize = 68;

/// Errors produced while exchanging handshakes.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The frame does not start with `19` and `"BitTorrent protocol"`.
    #[error("p2p: invalid handshake format")]
    InvalidFormat,
    #[error("p2p: failed to exchange handshake: {0}")]
    Io(#[from] io::Error),
}

/// A BitTorrent handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; SHA1_HASH_SIZE],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; SHA1_HASH_SIZE], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // Bytes 20..28 are the reserved bits, left zero.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received 68-byte handshake frame.
    pub fn parse(buf: &[u8; HANDSHAKE_SIZE]) -> Result<Handshake, HandshakeError> {
        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(HandshakeError::InvalidFormat);
        }

        let mut info_hash = [0u8; SHA1_HASH_SIZE];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    /// Write the handshake to a stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.serialize())
    }

    /// Read exactly one handshake frame from a stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Handshake, HandshakeError> {
        let mut buf = [0u8; HANDSHAKE_SIZE];
        r.read_exact(&mut buf)?;
        Handshake::parse(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let handshake = Handshake::new([0xab; 20], *b"00112233445566778899");
        let wire = handshake.serialize();
        assert_eq!(wire.len(), HANDSHAKE_SIZE);
        assert_eq!(wire[0], 19);
        assert_eq!(&wire[1..20], b"BitTorrent protocol");
        assert_eq!(wire[20..28], [0u8; 8]);

        let parsed = Handshake::parse(&wire).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn rejects_wrong_protocol_length() {
        let mut wire = Handshake::new([1; 20], [2; 20]).serialize();
        wire[0] = 18;
        assert!(matches!(
            Handshake::parse(&wire),
            Err(HandshakeError::InvalidFormat)
        ));
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut wire = Handshake::new([1; 20], [2; 20]).serialize();
        wire[1..20].copy_from_slice(b"BitTorrent protocoL");
        assert!(matches!(
            Handshake::parse(&wire),
            Err(HandshakeError::InvalidFormat)
        ));
    }

    #[test]
    fn reads_from_stream() {
        let handshake = Handshake::new([7; 20], [9; 20]);
        let mut stream: &[u8] = &handshake.serialize()[..];
        let parsed = Handshake::read_from(&mut stream).unwrap();
        assert_eq!(parsed, handshake);

        // A short stream is an error, not a partial handshake.
        let mut short: &[u8] = &handshake.serialize()[..40];
        assert!(matches!(
            Handshake::read_from(&mut short),
            Err(HandshakeError::Io(_))
        ));
    }
}
