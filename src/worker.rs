//! # Peer Session Worker
//!
//! One worker runs in its own thread and manages the complete session with a
//! single peer: connect and handshake (with bounded retries), the bitfield
//! and interest exchange, then the download loop.
//!
//! ## Download Loop
//!
//! The worker pulls piece descriptors from the shared work queue. For each
//! piece it pipelines up to five block requests, copies inbound blocks into
//! the shared piece buffer pool, and verifies the SHA-1 once the buffer
//! fills. Verified pieces go to the completion channel; failed pieces go
//! back onto the work queue.
//!
//! ## Failure Handling
//!
//! Any I/O error, deadline miss or framing violation ends the session: the
//! in-flight piece is re-enqueued and the worker re-dials the peer a bounded
//! number of times before giving up. A choking peer only pauses requests;
//! discarded in-flight requests are re-issued after the next unchoke.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::client::Client;
use crate::message::MessageId;
use crate::peer::Peer;
use crate::piece::{PiecePool, PieceResult, PieceWork};
use crate::swarm::{ConnectionMap, SwarmError};
use crate::torrent::{sha1, SHA1_HASH_SIZE};

/// Maximum number of in-flight block requests per peer.
const MAX_BACKLOG: usize = 5;

/// How many times a session is (re)started before the peer is dropped.
const MAX_SESSION_RESTARTS: u32 = 3;

/// Delay between session restarts.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// How often blocking queue reads wake up to observe cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Manages the session with a single peer.
pub struct Worker {
    peer: Peer,
    /// 20-byte identifier of this client instance
    peer_id: [u8; 20],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; SHA1_HASH_SIZE],
    /// Shared piece work queue (send side re-enqueues failures)
    work: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Completion channel towards the output writer
    done: Sender<PieceResult>,
    /// Shared in-flight piece buffers
    pieces: PiecePool,
    /// Engine connection registry; the worker deregisters itself on exit
    conns: ConnectionMap,
    /// Engine-wide cancellation
    shutdown: Arc<AtomicBool>,
    /// Cancellation for this session only
    stop: Arc<AtomicBool>,
    /// Live session counter
    active: Arc<AtomicU64>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Peer,
        peer_id: [u8; 20],
        info_hash: [u8; SHA1_HASH_SIZE],
        work: (Sender<PieceWork>, Receiver<PieceWork>),
        done: Sender<PieceResult>,
        pieces: PiecePool,
        conns: ConnectionMap,
        shutdown: Arc<AtomicBool>,
        stop: Arc<AtomicBool>,
        active: Arc<AtomicU64>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            work,
            done,
            pieces,
            conns,
            shutdown,
            stop,
            active,
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in small slices so cancellation stays observable.
    fn sleep_cancellable(&self, total: Duration) {
        let mut remaining = total;
        while !self.cancelled() && remaining > Duration::ZERO {
            let slice = remaining.min(CANCEL_POLL);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Run sessions against the peer until the work is done, the session
    /// budget is exhausted, or the engine shuts down.
    pub fn run(self) {
        let mut restarts = 0;
        while !self.cancelled() {
            match Client::connect(self.peer, self.info_hash, self.peer_id) {
                Ok(client) => {
                    if let Some(handle) = self.conns.write().unwrap().get_mut(&self.peer.addr()) {
                        handle.remote_peer_id = Some(client.remote_peer_id_hex());
                    }
                    self.active.fetch_add(1, Ordering::SeqCst);
                    let outcome = self.run_session(client);
                    self.active.fetch_sub(1, Ordering::SeqCst);

                    match outcome {
                        Ok(()) => break,
                        Err(err) => warn!("session with peer {} failed: {err:#}", self.peer),
                    }
                }
                Err(err) => debug!("could not reach peer {}: {err}", self.peer),
            }

            restarts += 1;
            if restarts >= MAX_SESSION_RESTARTS {
                debug!("giving up on peer {} after {restarts} attempts", self.peer);
                break;
            }
            self.sleep_cancellable(RESTART_DELAY);
        }

        self.conns.write().unwrap().remove(&self.peer.addr());
    }

    /// One connected session: bitfield, interest, then the download loop.
    fn run_session(&self, mut client: Client) -> Result<()> {
        client.read_bitfield()?;
        client.send_unchoke()?;
        client.send_interested()?;

        info!(
            "downloading from peer {} ({})",
            self.peer,
            client.remote_peer_id_hex()
        );

        loop {
            if self.cancelled() {
                client.shutdown();
                return Ok(());
            }

            let mut piece = match self.work.1.recv_timeout(CANCEL_POLL) {
                Ok(piece) => piece,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };

            if !client.has_piece(piece.index) {
                self.requeue(piece);
                // Let another session pick the piece up before trying again.
                self.sleep_cancellable(Duration::from_millis(50));
                continue;
            }

            match self.download_piece(&mut client, &mut piece) {
                Ok(data) => {
                    // The buffer is already out of the pool, dropping `data`
                    // discards it.
                    if sha1(&data) != piece.hash {
                        warn!(
                            "piece {} from peer {}: {}",
                            piece.index,
                            self.peer,
                            SwarmError::InvalidPieceHash
                        );
                        self.requeue(piece);
                        continue;
                    }

                    let index = piece.index;
                    if self.done.send(PieceResult { index, data }).is_err() {
                        // Writer is gone, the download is over.
                        return Ok(());
                    }
                    if let Err(err) = client.send_have(index) {
                        debug!("could not send Have to peer {}: {err}", self.peer);
                    }
                }
                Err(err) => {
                    self.requeue(piece);
                    client.shutdown();
                    return Err(err);
                }
            }
        }
    }

    /// Download every block of one piece into the shared buffer pool.
    ///
    /// Returns the complete (unverified) piece bytes, taken out of the pool.
    fn download_piece(&self, client: &mut Client, piece: &mut PieceWork) -> Result<Vec<u8>> {
        // Allocate the piece buffer, first session to touch the entry wins.
        self.pieces
            .lock()
            .unwrap()
            .entry(piece.hash)
            .or_insert_with(|| vec![0; piece.total_size as usize]);

        piece.downloaded = 0;
        let mut pending: VecDeque<(u32, u32)> = piece.block_ranges().collect();
        let mut in_flight: Vec<(u32, u32)> = Vec::with_capacity(MAX_BACKLOG);

        while piece.downloaded < piece.total_size {
            if self.cancelled() {
                bail!("session cancelled");
            }

            if !client.is_choked() {
                while in_flight.len() < MAX_BACKLOG {
                    let Some((begin, length)) = pending.pop_front() else {
                        break;
                    };
                    client.send_request(piece.index, begin, length)?;
                    in_flight.push((begin, length));
                }
            }

            let Some(message) = client.read_message()? else {
                continue; // keep-alive
            };

            match message.kind() {
                Some(MessageId::Choke) => {
                    client.set_choked(true);
                    // The peer discards pending requests when it chokes.
                    for block in in_flight.drain(..) {
                        pending.push_front(block);
                    }
                    debug!("peer {} choked us, requests paused", self.peer);
                }
                Some(MessageId::Unchoke) => {
                    client.set_choked(false);
                    debug!("peer {} unchoked us, requests resumed", self.peer);
                }
                Some(MessageId::Have) => {
                    if let Ok(index) = message.parse_have() {
                        client.set_piece(index);
                    }
                }
                Some(MessageId::Piece) => {
                    let (index, begin, block) = message.parse_piece()?;
                    if index != piece.index {
                        bail!("received block of piece {index}, expected {}", piece.index);
                    }
                    let end = begin as usize + block.len();
                    if end > piece.total_size as usize {
                        bail!("received block past the end of piece {index}");
                    }

                    let solicited = match in_flight.iter().position(|&(b, _)| b == begin) {
                        Some(at) => {
                            in_flight.swap_remove(at);
                            true
                        }
                        None => false,
                    };

                    let mut pool = self.pieces.lock().unwrap();
                    let buf = pool
                        .get_mut(&piece.hash)
                        .ok_or(SwarmError::PieceNotFound)?;
                    buf[begin as usize..end].copy_from_slice(block);
                    drop(pool);

                    // Duplicate blocks must not count towards completion.
                    if solicited {
                        piece.downloaded += block.len() as u32;
                    }
                }
                Some(other) => debug!("peer {} sent unexpected {other}", self.peer),
                None => debug!("peer {} sent unknown message id {}", self.peer, message.id),
            }
        }

        self.pieces
            .lock()
            .unwrap()
            .remove(&piece.hash)
            .ok_or_else(|| anyhow!(SwarmError::PieceNotFound))
    }

    fn requeue(&self, piece: PieceWork) {
        let index = piece.index;
        if self.work.0.send(piece).is_err() {
            debug!("work queue closed, dropping piece {index}");
        }
    }
}
