//! # Remora
//!
//! A minimal command-line BitTorrent client for single-file torrents.
//!
//! ## Usage
//!
//! ```bash
//! remora decode 5:hello
//! remora info sample.torrent
//! remora peers sample.torrent
//! remora handshake sample.torrent 10.0.0.1:6881
//! remora download sample.torrent sample.bin
//! ```
//!
//! ## Architecture
//!
//! The client is a leecher: it parses the metainfo, announces to the HTTP
//! tracker, and downloads pieces concurrently from the advertised peers.
//!
//! - **Main thread**: parses arguments, dispatches the command, and for
//!   `download` drains verified pieces to the output file in index order
//! - **Worker threads**: one per peer, speaking the peer wire protocol
//! - **Refresh thread**: periodic tracker announces keeping the pool fresh

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use remora::bencode;
use remora::client::Client;
use remora::peer::Peer;
use remora::swarm::{self, Swarm};
use remora::torrent::Torrent;
use remora::tracker::{self, Progress};

#[derive(Parser, Debug)]
#[command(version, about = "A minimal command-line BitTorrent client, written in Rust.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// The bencoded value, e.g. 5:hello
        value: String,
    },
    /// Print the metadata of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Print the peers advertised by the tracker
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Handshake with a single peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        addr: String,
    },
    /// Download the payload to a file
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Output filename
        output: PathBuf,
    },
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Decode { value } => {
            let decoded = bencode::decode(value.as_bytes())?;
            println!("{}", decoded.to_json());
        }
        Command::Info { torrent } => {
            let torrent = Torrent::open(torrent)?;
            println!("Tracker URL: {}", torrent.announce);
            println!("Length: {}", torrent.length);
            println!("Info Hash: {}", torrent.info_hash_hex());
            println!("Piece Length: {}", torrent.piece_length);
            println!("Piece Hashes:");
            for hash in &torrent.piece_hashes {
                println!("{}", hex::encode(hash));
            }
        }
        Command::Peers { torrent } => {
            let torrent = Torrent::open(torrent)?;
            let response = tracker::announce(
                &torrent,
                &swarm::generate_peer_id(),
                swarm::DEFAULT_PORT,
                Progress {
                    left: torrent.length,
                    ..Default::default()
                },
            )?;
            for peer in response.peers {
                println!("{peer}");
            }
        }
        Command::Handshake { torrent, addr } => {
            let torrent = Torrent::open(torrent)?;
            let peer: Peer = addr.parse()?;
            let client = Client::connect(peer, torrent.info_hash, swarm::generate_peer_id())?;
            println!("Peer ID: {}", client.remote_peer_id_hex());
        }
        Command::Download { torrent, output } => {
            let torrent = Torrent::open(torrent)?;
            let mut out = File::create(&output)
                .with_context(|| format!("could not create output file {:?}", output))?;

            let swarm = Swarm::start(torrent, swarm::generate_peer_id())?;
            swarm.download(&mut out)?;

            println!("Saved in {:?}.", output);
        }
    }

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Run the selected command, eventually exit failure
    if let Err(error) = run(Cli::parse()) {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
