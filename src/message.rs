//! # Peer Wire Messages
//!
//! After the handshake, peers exchange length-prefixed frames:
//!
//! ```text
//! <length: u32 BE><id: u8><payload>
//! ```
//!
//! A length of 0 is a keep-alive with no id and no payload. Message ids:
//!
//! | ID | Name          | Payload |
//! |----|---------------|---------|
//! | 0  | Choke         | - |
//! | 1  | Unchoke       | - |
//! | 2  | Interested    | - |
//! | 3  | NotInterested | - |
//! | 4  | Have          | piece index (u32 BE) |
//! | 5  | Bitfield      | bit vector, MSB-first |
//! | 6  | Request       | index, begin, length (3x u32 BE) |
//! | 7  | Piece         | index, begin, block bytes |
//! | 8  | Cancel        | index, begin, length (3x u32 BE) |
//!
//! Ids outside this table are carried through so the session can log and
//! skip them instead of aborting.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Upper bound on one frame, comfortably above a 16 KiB block plus header.
const MAX_MESSAGE_SIZE: u32 = 1 << 20;

/// Errors produced while interpreting a message payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("p2p: invalid {kind} payload of {got} bytes")]
    InvalidPayload { kind: &'static str, got: usize },
}

/// The known peer wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
}

impl MessageId {
    /// Map a wire id byte to a known message kind.
    pub fn from_byte(byte: u8) -> Option<MessageId> {
        match byte {
            0 => Some(MessageId::Choke),
            1 => Some(MessageId::Unchoke),
            2 => Some(MessageId::Interested),
            3 => Some(MessageId::NotInterested),
            4 => Some(MessageId::Have),
            5 => Some(MessageId::Bitfield),
            6 => Some(MessageId::Request),
            7 => Some(MessageId::Piece),
            8 => Some(MessageId::Cancel),
            _ => None,
        }
    }

    /// The wire id byte for this kind.
    pub fn byte(self) -> u8 {
        match self {
            MessageId::Choke => 0,
            MessageId::Unchoke => 1,
            MessageId::Interested => 2,
            MessageId::NotInterested => 3,
            MessageId::Have => 4,
            MessageId::Bitfield => 5,
            MessageId::Request => 6,
            MessageId::Piece => 7,
            MessageId::Cancel => 8,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageId::Choke => "Choke",
            MessageId::Unchoke => "Unchoke",
            MessageId::Interested => "Interested",
            MessageId::NotInterested => "NotInterested",
            MessageId::Have => "Have",
            MessageId::Bitfield => "Bitfield",
            MessageId::Request => "Request",
            MessageId::Piece => "Piece",
            MessageId::Cancel => "Cancel",
        };
        f.write_str(name)
    }
}

/// One non-keep-alive peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw wire id (unknown ids are preserved)
    pub id: u8,
    /// Message payload data
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a payload-less message.
    pub fn new(id: MessageId) -> Message {
        Message {
            id: id.byte(),
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message {
            id: id.byte(),
            payload,
        }
    }

    /// Build a Request message for one block.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Block size in bytes.
    ///
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.write_u32::<BigEndian>(index).unwrap();
        payload.write_u32::<BigEndian>(begin).unwrap();
        payload.write_u32::<BigEndian>(length).unwrap();
        Message::with_payload(MessageId::Request, payload)
    }

    /// Build a Cancel message for one block.
    pub fn cancel(index: u32, begin: u32, length: u32) -> Message {
        let mut request = Message::request(index, begin, length);
        request.id = MessageId::Cancel.byte();
        request
    }

    /// Build a Have message for a completed piece.
    pub fn have(index: u32) -> Message {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<BigEndian>(index).unwrap();
        Message::with_payload(MessageId::Have, payload)
    }

    /// The known kind of this message, if the id is in the table.
    pub fn kind(&self) -> Option<MessageId> {
        MessageId::from_byte(self.id)
    }

    /// Serialize the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 1 + self.payload.len());
        buf.write_u32::<BigEndian>(1 + self.payload.len() as u32)
            .unwrap();
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Write the framed message to a stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.serialize())
    }

    /// Read one frame from a stream.
    ///
    /// Returns `None` for a keep-alive (length 0). Short reads and oversized
    /// lengths are fatal errors.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<Message>> {
        let length = r.read_u32::<BigEndian>()?;
        if length == 0 {
            return Ok(None);
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {length} exceeds limit"),
            ));
        }

        let id = r.read_u8()?;
        let mut payload = vec![0u8; length as usize - 1];
        r.read_exact(&mut payload)?;

        Ok(Some(Message { id, payload }))
    }

    /// Parse the piece index out of a Have payload.
    pub fn parse_have(&self) -> Result<u32, MessageError> {
        if self.payload.len() != 4 {
            return Err(MessageError::InvalidPayload {
                kind: "Have",
                got: self.payload.len(),
            });
        }
        let mut cursor = io::Cursor::new(&self.payload);
        Ok(cursor.read_u32::<BigEndian>().unwrap())
    }

    /// Parse a Piece payload into `(index, begin, block)`.
    pub fn parse_piece(&self) -> Result<(u32, u32, &[u8]), MessageError> {
        if self.payload.len() < 8 {
            return Err(MessageError::InvalidPayload {
                kind: "Piece",
                got: self.payload.len(),
            });
        }
        let mut cursor = io::Cursor::new(&self.payload[..8]);
        let index = cursor.read_u32::<BigEndian>().unwrap();
        let begin = cursor.read_u32::<BigEndian>().unwrap();
        Ok((index, begin, &self.payload[8..]))
    }
}
