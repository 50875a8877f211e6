//! # Swarm Engine
//!
//! The swarm owns everything a download needs: the announce refresh loop,
//! the pool of live peer sessions, the shared piece work queue, the piece
//! buffer pool, and the output writer.
//!
//! ## Architecture
//!
//! - **Worker threads**: one per peer, each running a session (see
//!   [`crate::worker`])
//! - **Refresh thread**: re-announces every `interval` seconds, dialing new
//!   peers and dropping ones the tracker no longer advertises
//! - **Writer**: the caller of [`Swarm::download`] drains verified pieces
//!   from the completion channel and writes them in ascending index order
//!
//! ## Cancellation
//!
//! A single shutdown flag is broadcast to every thread. Sessions observe it
//! between messages; blocking socket I/O is bounded by the 10-second
//! deadlines, so nothing blocks indefinitely. Ten consecutive announce
//! failures also trigger shutdown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;

use crate::peer::Peer;
use crate::piece::{plan_pieces, PiecePool, PieceResult, PieceWork};
use crate::torrent::Torrent;
use crate::tracker::{self, Progress};
use crate::worker::Worker;

/// Port advertised to the tracker (never actually bound in leech mode).
pub const DEFAULT_PORT: u16 = 6881;

/// Consecutive announce failures tolerated before the swarm shuts down.
const MAX_ANNOUNCE_FAILURES: u32 = 10;

/// How often blocking waits wake up to observe cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Errors produced by the swarm engine.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The first announce returned an empty peer list.
    #[error("p2p: no peers")]
    NoPeers,
    /// A completed piece is missing from the buffer pool.
    #[error("p2p: downloaded piece was not found in the buffer pool")]
    PieceNotFound,
    /// A completed piece does not match its published hash.
    #[error("p2p: invalid downloaded piece hash")]
    InvalidPieceHash,
}

/// Registry entry for one live (or dialing) peer session.
pub struct SessionHandle {
    pub peer: Peer,
    /// Per-session cancellation, set when the peer is dropped
    pub stop: Arc<AtomicBool>,
    /// Remote peer id (hex) once the handshake succeeded
    pub remote_peer_id: Option<String>,
}

/// Connection registry shared between the engine and its workers.
pub type ConnectionMap = Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>;

/// Generate a random 20-byte ASCII peer id.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    for byte in peer_id.iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    peer_id
}

/// Shared engine state, held by the `Swarm` handle and every thread.
struct Inner {
    torrent: Torrent,
    peer_id: [u8; 20],
    work: (Sender<PieceWork>, Receiver<PieceWork>),
    done_tx: Sender<PieceResult>,
    conns: ConnectionMap,
    pieces: PiecePool,
    shutdown: Arc<AtomicBool>,
    /// Live session count
    active: Arc<AtomicU64>,
    /// Verified piece count
    completed: Arc<AtomicU64>,
    /// Bytes written so far, reported to the tracker as progress
    downloaded: AtomicU64,
}

impl Inner {
    fn announce(&self) -> Result<tracker::AnnounceResponse, tracker::TrackerError> {
        let downloaded = self.downloaded.load(Ordering::SeqCst);
        tracker::announce(
            &self.torrent,
            &self.peer_id,
            DEFAULT_PORT,
            Progress {
                uploaded: 0,
                downloaded,
                left: self.torrent.length.saturating_sub(downloaded),
            },
        )
    }

    /// Dial and register every advertised peer not already connected.
    fn spawn_missing_sessions(self: &Arc<Inner>, peers: &[Peer]) {
        for &peer in peers {
            let addr = peer.addr();
            let stop = Arc::new(AtomicBool::new(false));
            {
                let mut conns = self.conns.write().unwrap();
                if conns.contains_key(&addr) {
                    continue;
                }
                conns.insert(
                    addr,
                    SessionHandle {
                        peer,
                        stop: stop.clone(),
                        remote_peer_id: None,
                    },
                );
            }

            debug!("adding peer {peer}");
            let worker = Worker::new(
                peer,
                self.peer_id,
                self.torrent.info_hash,
                (self.work.0.clone(), self.work.1.clone()),
                self.done_tx.clone(),
                self.pieces.clone(),
                self.conns.clone(),
                self.shutdown.clone(),
                stop,
                self.active.clone(),
            );
            thread::spawn(move || worker.run());
        }
    }

    /// Stop sessions for peers the tracker no longer advertises.
    fn drop_stale_sessions(&self, peers: &[Peer]) {
        let advertised: HashSet<SocketAddr> = peers.iter().map(Peer::addr).collect();
        self.conns.write().unwrap().retain(|addr, handle| {
            if advertised.contains(addr) {
                return true;
            }
            debug!("dropping peer {} no longer advertised", handle.peer);
            handle.stop.store(true, Ordering::SeqCst);
            false
        });
    }

    /// Re-announce every `interval` seconds until shutdown.
    fn refresh_loop(self: Arc<Inner>, interval: u64) {
        debug!("starting announce refresh every {interval}s");
        let mut failures = 0u32;

        loop {
            // Sleep in slices so shutdown stays observable.
            let mut remaining = Duration::from_secs(interval);
            while !self.shutdown.load(Ordering::SeqCst) && remaining > Duration::ZERO {
                let slice = remaining.min(CANCEL_POLL);
                thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("closing announce refresh");
                return;
            }

            match self.announce() {
                Ok(response) => {
                    failures = 0;
                    self.drop_stale_sessions(&response.peers);
                    self.spawn_missing_sessions(&response.peers);
                }
                Err(err) => {
                    failures += 1;
                    debug!("announce refresh failed ({failures} in a row): {err}");
                    if failures >= MAX_ANNOUNCE_FAILURES {
                        warn!("too many announce failures, shutting the swarm down");
                        self.shutdown.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    }
}

/// A running download swarm.
pub struct Swarm {
    inner: Arc<Inner>,
    done_rx: Receiver<PieceResult>,
    refresh: Option<JoinHandle<()>>,
}

impl Swarm {
    /// Announce, connect to the advertised peers and start the refresh loop.
    ///
    /// Fails with [`SwarmError::NoPeers`] when the first announce returns an
    /// empty peer list.
    pub fn start(torrent: Torrent, peer_id: [u8; 20]) -> Result<Swarm> {
        let num_pieces = torrent.num_pieces();
        let (done_tx, done_rx) = bounded(num_pieces);

        let inner = Arc::new(Inner {
            peer_id,
            work: bounded(num_pieces),
            done_tx,
            conns: Arc::new(RwLock::new(HashMap::new())),
            pieces: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            downloaded: AtomicU64::new(0),
            torrent,
        });

        let response = inner.announce()?;
        if response.peers.is_empty() {
            bail!(SwarmError::NoPeers);
        }
        info!("tracker advertised {} peers", response.peers.len());

        inner.spawn_missing_sessions(&response.peers);
        let refresh = {
            let inner = inner.clone();
            let interval = response.interval;
            thread::spawn(move || inner.refresh_loop(interval))
        };

        Ok(Swarm {
            inner,
            done_rx,
            refresh: Some(refresh),
        })
    }

    /// Number of currently live peer sessions.
    pub fn active_sessions(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of verified pieces so far.
    pub fn completed_pieces(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Download the whole payload, writing pieces in ascending index order.
    ///
    /// Blocks until every piece has been verified and written, or until the
    /// swarm shuts down early.
    pub fn download<W: Write>(&self, out: &mut W) -> Result<()> {
        let torrent = &self.inner.torrent;
        let total = torrent.num_pieces() as u32;

        info!("downloading {:?} ({} pieces)", torrent.name, total);

        // Seed the work queue, ascending by index.
        for piece in plan_pieces(torrent) {
            if self.inner.work.0.send(piece).is_err() {
                bail!("could not seed the piece work queue");
            }
        }

        let bar = ProgressBar::new(torrent.length);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Hold back out-of-order pieces until their turn comes.
        let mut held: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut next_index = 0u32;
        let mut received = 0u32;

        while received < total {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                bail!("swarm shut down before the download completed");
            }

            let piece = match self.done_rx.recv_timeout(CANCEL_POLL) {
                Ok(piece) => piece,
                Err(RecvTimeoutError::Timeout) => {
                    debug!(
                        "waiting for pieces ({}/{total} done, {} sessions)",
                        received,
                        self.active_sessions()
                    );
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("completion channel closed before the download completed")
                }
            };

            if piece.index < next_index || held.contains_key(&piece.index) {
                debug!("ignoring duplicate result for piece {}", piece.index);
                continue;
            }

            received += 1;
            self.inner.completed.fetch_add(1, Ordering::SeqCst);
            bar.inc(piece.data.len() as u64);
            held.insert(piece.index, piece.data);

            // Flush every piece that is now in order.
            while let Some(data) = held.remove(&next_index) {
                self.inner
                    .downloaded
                    .fetch_add(data.len() as u64, Ordering::SeqCst);
                out.write_all(&data)?;
                next_index += 1;
            }
        }

        bar.finish();
        self.close();
        Ok(())
    }

    /// Broadcast cancellation to the refresh loop and every session.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for handle in self.inner.conns.read().unwrap().values() {
            handle.stop.store(true, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm").finish_non_exhaustive()
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        self.close();
        if let Some(refresh) = self.refresh.take() {
            let _ = refresh.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_ascii() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert!(peer_id.iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn peer_ids_differ() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
