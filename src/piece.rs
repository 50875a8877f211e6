//! # Piece Work Planning
//!
//! Pieces are the verification units of the torrent: every piece has a
//! published SHA-1 hash. Pieces are downloaded in blocks of at most 16 KiB,
//! requested individually over the peer wire protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::torrent::{Torrent, SHA1_HASH_SIZE};

/// Standard block size for piece downloads (16 KiB).
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Descriptor for one piece waiting to be downloaded.
///
/// Work descriptors travel through the swarm's work queue; the piece bytes
/// themselves accumulate in the shared buffer pool, not here.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// SHA-1 hash of the piece for verification
    pub hash: [u8; SHA1_HASH_SIZE],
    /// Total length of the piece in bytes
    pub total_size: u32,
    /// Ordered block sizes, each at most [`BLOCK_SIZE`], summing to `total_size`
    pub blocks: Vec<u32>,
    /// Bytes received so far for this attempt
    pub downloaded: u32,
}

impl PieceWork {
    /// Build a work descriptor, splitting the piece into blocks.
    pub fn new(index: u32, hash: [u8; SHA1_HASH_SIZE], total_size: u32) -> PieceWork {
        let mut blocks = Vec::with_capacity(total_size.div_ceil(BLOCK_SIZE) as usize);
        let mut remaining = total_size;
        while remaining > 0 {
            let block = remaining.min(BLOCK_SIZE);
            blocks.push(block);
            remaining -= block;
        }

        PieceWork {
            index,
            hash,
            total_size,
            blocks,
            downloaded: 0,
        }
    }

    /// Iterate the `(begin, length)` range of every block.
    pub fn block_ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.blocks.iter().scan(0u32, |offset, &length| {
            let begin = *offset;
            *offset += length;
            Some((begin, length))
        })
    }
}

/// A downloaded and verified piece on its way to the output writer.
#[derive(Debug)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete, verified piece data
    pub data: Vec<u8>,
}

/// Shared pool of in-flight piece buffers, keyed by piece hash.
///
/// Buffers are allocated idempotently when the first block arrives and taken
/// out of the pool once the piece is complete.
pub type PiecePool = Arc<Mutex<HashMap<[u8; SHA1_HASH_SIZE], Vec<u8>>>>;

/// Compute the ordered work plan for a torrent, ascending by index.
pub fn plan_pieces(torrent: &Torrent) -> Vec<PieceWork> {
    torrent
        .piece_hashes
        .iter()
        .enumerate()
        .map(|(index, hash)| {
            let index = index as u32;
            PieceWork::new(index, *hash, torrent.piece_size(index) as u32)
        })
        .collect()
}
