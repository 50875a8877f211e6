//! # Torrent Metainfo
//!
//! This module parses single-file torrent descriptors (metainfo files).
//!
//! ## Torrent File Format
//!
//! Torrent files contain bencoded metadata:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **info**: Dictionary with file information and piece hashes
//!   - **name**: Suggested filename
//!   - **length**: Total file size in bytes
//!   - **piece length**: Size of each piece (all but the last)
//!   - **pieces**: Concatenated 20-byte SHA-1 digests, one per piece
//!
//! ## Info-Hash
//!
//! The info-hash identifies the torrent on the wire. It is the SHA-1 of the
//! canonical bencode encoding of the `info` dictionary. The hash is computed
//! from the decoded value itself, so keys this client does not model (for
//! example `private`) still contribute to it.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use boring::sha::Sha1;
use thiserror::Error;

use crate::bencode::{self, BencodeError, Value};

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

/// Errors produced while interpreting a metainfo file.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    /// A required field is missing or has the wrong kind.
    #[error("metainfo: failed to convert the field `{field}` to the wanted type `{expected}`")]
    Convert {
        field: &'static str,
        expected: &'static str,
    },
    /// The fields are present but violate a metainfo invariant.
    #[error("metainfo: {0}")]
    Invalid(String),
    #[error("metainfo: could not read the torrent file: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed single-file torrent descriptor.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// URL of the tracker
    pub announce: String,
    /// Suggested filename where to save the file
    pub name: String,
    /// Client that created the torrent, when recorded
    pub created_by: Option<String>,
    /// Total size of the file in bytes
    pub length: u64,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u64,
    /// SHA-1 hash of the bencoded info dictionary
    pub info_hash: [u8; SHA1_HASH_SIZE],
    /// One 20-byte SHA-1 hash per piece
    pub piece_hashes: Vec<[u8; SHA1_HASH_SIZE]>,
}

impl Torrent {
    /// Open and parse a torrent file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Torrent, TorrentError> {
        let mut file = File::open(path)?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)?;
        Torrent::from_bytes(&buf)
    }

    /// Parse a torrent descriptor from bencoded bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent, TorrentError> {
        let decoded = bencode::decode(data)?;
        let root = decoded.as_dict().ok_or(TorrentError::Convert {
            field: "metainfo",
            expected: "dictionary",
        })?;

        let announce = decoded
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or(TorrentError::Convert {
                field: "announce",
                expected: "string",
            })?
            .to_string();

        let created_by = root
            .get(b"created by".as_slice())
            .and_then(Value::as_str)
            .map(str::to_string);

        let info = decoded.get(b"info").ok_or(TorrentError::Convert {
            field: "info",
            expected: "dictionary",
        })?;
        if info.as_dict().is_none() {
            return Err(TorrentError::Convert {
                field: "info",
                expected: "dictionary",
            });
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or(TorrentError::Convert {
                field: "name",
                expected: "string",
            })?
            .to_string();

        let length = info
            .get(b"length")
            .and_then(Value::as_int)
            .filter(|n| *n >= 1)
            .ok_or(TorrentError::Convert {
                field: "length",
                expected: "positive integer",
            })? as u64;

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|n| *n >= 1)
            .ok_or(TorrentError::Convert {
                field: "piece length",
                expected: "positive integer",
            })? as u64;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(TorrentError::Convert {
                field: "pieces",
                expected: "string",
            })?;

        // Check torrent pieces
        if pieces.is_empty() || pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(TorrentError::Invalid(format!(
                "pieces length {} is not a multiple of {}",
                pieces.len(),
                SHA1_HASH_SIZE
            )));
        }

        // Split pieces into 20-byte digests
        let piece_hashes: Vec<[u8; SHA1_HASH_SIZE]> = pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| chunk.try_into().unwrap())
            .collect();

        // One hash per piece
        let expected_pieces = length.div_ceil(piece_length);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(TorrentError::Invalid(format!(
                "expected {} piece hashes for {} bytes, got {}",
                expected_pieces,
                length,
                piece_hashes.len()
            )));
        }

        // Hash the canonically re-encoded info dictionary
        let info_hash = sha1(&bencode::encode(info));

        Ok(Torrent {
            announce,
            name,
            created_by,
            length,
            piece_length,
            info_hash,
            piece_hashes,
        })
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece at `index` in bytes.
    ///
    /// All pieces but the last are exactly `piece_length`.
    pub fn piece_size(&self, index: u32) -> u64 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        end - begin
    }

    /// Byte offset of the piece at `index` within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// The info-hash rendered as 40 hex characters.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Compute the SHA-1 digest of a buffer.
pub fn sha1(data: &[u8]) -> [u8; SHA1_HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finish()
}
