//! # Remora
//!
//! A minimal BitTorrent leecher for single-file torrents.
//!
//! The crate is organized leaves-first:
//!
//! - [`bencode`]: the serialization format used by metainfo files and
//!   tracker replies
//! - [`torrent`]: metainfo parsing and the canonical info-hash
//! - [`tracker`]: HTTP announce client
//! - [`handshake`] / [`message`]: the peer wire codec
//! - [`peer`] / [`piece`] / [`client`] / [`worker`] / [`swarm`]: the
//!   concurrent download engine

pub mod bencode;
pub mod client;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod piece;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod worker;
