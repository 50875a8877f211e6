//! # Peer Connection
//!
//! One `Client` owns the TCP connection to a single remote peer and speaks
//! the peer wire protocol over it: the initial handshake exchange, then
//! length-prefixed messages.
//!
//! ## Connection States
//!
//! - **Choked**: the peer will not answer piece requests
//! - **Interested**: this client wants to download from the peer
//! - **Unchoked**: piece requests will be answered
//!
//! Every socket read and write carries a deadline, so a stalled peer turns
//! into an I/O error for the session instead of blocking forever.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::handshake::{Handshake, HandshakeError};
use crate::message::{Message, MessageId};
use crate::peer::Peer;
use crate::torrent::SHA1_HASH_SIZE;

/// Deadline applied to every socket read and write.
pub const RW_DEADLINE: Duration = Duration::from_secs(10);

/// How many frames to sift through while waiting for the bitfield.
const BITFIELD_WAIT_FRAMES: usize = 16;

/// Errors produced on a peer connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("p2p: could not connect to peer {0}")]
    Connect(Peer),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// The peer answered the handshake for a different torrent.
    #[error("p2p: handshake info hash does not match the torrent")]
    InfoHashMismatch,
    #[error("p2p: failed to write to the connection: {0}")]
    WriteConn(io::Error),
    #[error("p2p: failed to read from the connection: {0}")]
    ReadConn(io::Error),
    /// The peer never produced the message the session was waiting for.
    #[error("p2p: no usable command received from the connection")]
    NoCommand,
}

/// A live connection to a remote peer.
pub struct Client {
    conn: TcpStream,
    peer: Peer,
    /// Remote peer id from the handshake reply
    remote_peer_id: [u8; 20],
    /// Which pieces the peer advertises (MSB-first bit vector)
    bitfield: Vec<u8>,
    /// Whether the peer currently chokes us
    choked: bool,
}

impl Client {
    /// Dial a peer and perform the handshake.
    ///
    /// The returned client starts choked, with an empty bitfield, and with
    /// read/write deadlines applied to the socket.
    pub fn connect(
        peer: Peer,
        info_hash: [u8; SHA1_HASH_SIZE],
        peer_id: [u8; 20],
    ) -> Result<Client, ClientError> {
        let mut conn = TcpStream::connect_timeout(&peer.addr(), RW_DEADLINE)
            .map_err(|_| ClientError::Connect(peer))?;
        conn.set_read_timeout(Some(RW_DEADLINE))
            .map_err(ClientError::ReadConn)?;
        conn.set_write_timeout(Some(RW_DEADLINE))
            .map_err(ClientError::WriteConn)?;

        Handshake::new(info_hash, peer_id)
            .write_to(&mut conn)
            .map_err(ClientError::WriteConn)?;
        let reply = Handshake::read_from(&mut conn)?;
        if reply.info_hash != info_hash {
            return Err(ClientError::InfoHashMismatch);
        }

        debug!("connected to peer {} ({})", peer, hex::encode(reply.peer_id));

        Ok(Client {
            conn,
            peer,
            remote_peer_id: reply.peer_id,
            bitfield: vec![],
            choked: true,
        })
    }

    /// The remote peer's address record.
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// The remote peer id from the handshake, hex-rendered for display.
    pub fn remote_peer_id_hex(&self) -> String {
        hex::encode(self.remote_peer_id)
    }

    /// Whether the peer currently chokes this client.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    /// Whether the peer advertises the piece at `index`.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;
        match self.bitfield.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Mark the piece at `index` as available (Have messages).
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;
        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - offset);
    }

    /// Wait for the peer's bitfield, which follows the handshake.
    ///
    /// Keep-alives and unknown messages are skipped; Have messages arriving
    /// early are folded into the bitfield.
    pub fn read_bitfield(&mut self) -> Result<(), ClientError> {
        for _ in 0..BITFIELD_WAIT_FRAMES {
            let message = match self.read_message()? {
                Some(message) => message,
                None => continue,
            };
            match message.kind() {
                Some(MessageId::Bitfield) => {
                    self.bitfield = message.payload;
                    return Ok(());
                }
                Some(MessageId::Have) => {
                    if let Ok(index) = message.parse_have() {
                        self.set_piece(index);
                    }
                }
                Some(other) => {
                    debug!("peer {} sent {} before bitfield", self.peer, other);
                }
                None => {
                    debug!("peer {} sent unknown message id {}", self.peer, message.id);
                }
            }
        }
        Err(ClientError::NoCommand)
    }

    /// Read the next frame; `None` is a keep-alive.
    pub fn read_message(&mut self) -> Result<Option<Message>, ClientError> {
        let message = Message::read_from(&mut self.conn).map_err(ClientError::ReadConn)?;
        if message.is_none() {
            info!("received keep-alive from peer {}", self.peer);
        }
        Ok(message)
    }

    fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        message
            .write_to(&mut self.conn)
            .map_err(ClientError::WriteConn)
    }

    /// Tell the peer this client wants to download.
    pub fn send_interested(&mut self) -> Result<(), ClientError> {
        debug!("send Interested to peer {}", self.peer);
        self.send(&Message::new(MessageId::Interested))
    }

    /// Tell the peer it may request pieces from us (courtesy in leech mode).
    pub fn send_unchoke(&mut self) -> Result<(), ClientError> {
        debug!("send Unchoke to peer {}", self.peer);
        self.send(&Message::new(MessageId::Unchoke))
    }

    /// Request one block of a piece.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), ClientError> {
        debug!(
            "send Request for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(&Message::request(index, begin, length))
    }

    /// Announce a completed piece to the peer.
    pub fn send_have(&mut self, index: u32) -> Result<(), ClientError> {
        debug!("send Have for piece {} to peer {}", index, self.peer);
        self.send(&Message::have(index))
    }

    /// Close both directions of the connection.
    pub fn shutdown(&self) {
        let _ = self.conn.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    use crate::handshake::HANDSHAKE_SIZE;

    fn local_peer(listener: &TcpListener) -> Peer {
        let port = listener.local_addr().unwrap().port();
        Peer::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn connects_and_exchanges_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_SIZE];
            sock.read_exact(&mut buf).unwrap();
            let received = Handshake::parse(&buf).unwrap();
            assert_eq!(received.peer_id, *b"00112233445566778899");

            let reply = Handshake::new(received.info_hash, [0x2a; 20]);
            reply.write_to(&mut sock).unwrap();
            // Follow up with a bitfield after a keep-alive.
            sock.write_all(&[0, 0, 0, 0]).unwrap();
            Message::with_payload(MessageId::Bitfield, vec![0b1100_0000])
                .write_to(&mut sock)
                .unwrap();
        });

        let mut client = Client::connect(peer, [7; 20], *b"00112233445566778899").unwrap();
        assert_eq!(client.remote_peer_id_hex(), "2a".repeat(20));
        assert!(client.is_choked());

        client.read_bitfield().unwrap();
        assert!(client.has_piece(0));
        assert!(client.has_piece(1));
        assert!(!client.has_piece(2));

        server.join().unwrap();
    }

    #[test]
    fn rejects_mismatched_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_SIZE];
            sock.read_exact(&mut buf).unwrap();
            Handshake::new([0xee; 20], [0x2a; 20])
                .write_to(&mut sock)
                .unwrap();
        });

        let result = Client::connect(peer, [7; 20], *b"00112233445566778899");
        assert!(matches!(result, Err(ClientError::InfoHashMismatch)));
        server.join().unwrap();
    }

    #[test]
    fn tracks_have_updates() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_SIZE];
            sock.read_exact(&mut buf).unwrap();
            Handshake::new([7; 20], [0x2a; 20])
                .write_to(&mut sock)
                .unwrap();
        });

        let mut client = Client::connect(peer, [7; 20], *b"00112233445566778899").unwrap();
        server.join().unwrap();

        assert!(!client.has_piece(9));
        client.set_piece(9);
        assert!(client.has_piece(9));
        assert!(!client.has_piece(8));
    }
}
