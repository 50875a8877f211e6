//! # Tracker Client
//!
//! This module talks to the HTTP tracker named by the metainfo `announce`
//! URL. An announce is a single GET whose query parameters describe this
//! client; the bencoded response carries the refresh interval and a compact
//! peer list.
//!
//! ## Info-Hash Encoding
//!
//! The 20-byte info-hash is raw binary, so it cannot go through normal
//! query-string encoding. It is appended after the encoded query as
//! `&info_hash=<urlenc>`, percent-encoding byte by byte: bytes in the URI
//! unreserved set (`A-Z`, `a-z`, `0-9`, `-`, `.`, `_`, `~`) pass through,
//! everything else becomes uppercase `%HH`.

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::bencode::{self, BencodeError, Value};
use crate::peer::{self, Peer, PeerError};
use crate::torrent::{Torrent, SHA1_HASH_SIZE};

/// HTTP timeout for one announce request.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors produced while announcing to the tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker: failed to parse the announce url `{0}`")]
    ParseAnnounceUrl(String),
    #[error("tracker: failed to GET the announce: {0}")]
    GetAnnounce(#[from] reqwest::Error),
    #[error("tracker: failed to decode the announce body: {0}")]
    DecodeAnnounceBody(#[from] BencodeError),
    #[error("tracker: failed to convert the field `{field}` to the wanted type `{expected}`")]
    Convert {
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Peers(#[from] PeerError),
}

/// A successful tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce
    pub interval: u64,
    /// Peers currently in the swarm
    pub peers: Vec<Peer>,
}

/// Progress figures reported to the tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Announce to the torrent's tracker and decode the reply.
///
/// # Arguments
///
/// * `torrent` - The torrent being announced.
/// * `peer_id` - 20-byte ASCII identifier for this client.
/// * `port` - Port number advertised to the tracker.
/// * `progress` - Uploaded/downloaded/left byte counts.
///
pub fn announce(
    torrent: &Torrent,
    peer_id: &[u8; 20],
    port: u16,
    progress: Progress,
) -> Result<AnnounceResponse, TrackerError> {
    let url = build_announce_url(&torrent.announce, &torrent.info_hash, peer_id, port, progress)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;
    let body = client.get(&url).send()?.bytes()?;

    parse_announce_response(&body)
}

/// Build the announce URL for a tracker request.
pub fn build_announce_url(
    announce: &str,
    info_hash: &[u8; SHA1_HASH_SIZE],
    peer_id: &[u8; 20],
    port: u16,
    progress: Progress,
) -> Result<String, TrackerError> {
    let mut url =
        Url::parse(announce).map_err(|_| TrackerError::ParseAnnounceUrl(announce.to_string()))?;

    url.query_pairs_mut()
        .append_pair("peer_id", &String::from_utf8_lossy(peer_id))
        .append_pair("port", &port.to_string())
        .append_pair("uploaded", &progress.uploaded.to_string())
        .append_pair("downloaded", &progress.downloaded.to_string())
        .append_pair("left", &progress.left.to_string())
        .append_pair("compact", "1");

    // The raw hash would be mangled by the standard query encoder, so it is
    // appended after it, percent-encoded byte by byte.
    Ok(format!("{}&info_hash={}", url, urlencode_bytes(info_hash)))
}

/// Percent-encode raw bytes for a URL query value.
///
/// Bytes in the URI unreserved set pass through unchanged, all others are
/// encoded as uppercase `%HH`.
fn urlencode_bytes(data: &[u8]) -> String {
    let mut encoded = String::with_capacity(data.len() * 3);
    for &byte in data {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Decode a bencoded announce reply body.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let decoded = bencode::decode(body)?;
    if decoded.as_dict().is_none() {
        return Err(TrackerError::Convert {
            field: "announce response",
            expected: "dictionary",
        });
    }

    let interval = decoded
        .get(b"interval")
        .and_then(Value::as_int)
        .filter(|n| *n >= 1)
        .ok_or(TrackerError::Convert {
            field: "interval",
            expected: "positive integer",
        })? as u64;

    let peers = decoded
        .get(b"peers")
        .and_then(Value::as_bytes)
        .ok_or(TrackerError::Convert {
            field: "peers",
            expected: "string",
        })?;

    Ok(AnnounceResponse {
        interval,
        peers: peer::from_compact(peers)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_HASH: [u8; 20] = [
        0xd6, 0x9f, 0x91, 0xe6, 0xb2, 0xae, 0x4c, 0x54, 0x24, 0x68, 0xd1, 0x07, 0x3a, 0x71, 0xd4,
        0xea, 0x13, 0x87, 0x9a, 0x7f,
    ];

    fn progress(left: u64) -> Progress {
        Progress {
            uploaded: 0,
            downloaded: 0,
            left,
        }
    }

    #[test]
    fn builds_announce_url() {
        let url = build_announce_url(
            "http://bittorrent-test-tracker.codecrafters.io/announce",
            &INFO_HASH,
            b"00112233445566778899",
            6881,
            progress(92063),
        )
        .unwrap();

        assert!(url.starts_with(
            "http://bittorrent-test-tracker.codecrafters.io/announce\
             ?peer_id=00112233445566778899&port=6881&uploaded=0&downloaded=0\
             &left=92063&compact=1"
        ));
        // Unreserved bytes (L, T, h, q) pass through, all others are %HH.
        assert!(url.ends_with("&info_hash=%D6%9F%91%E6%B2%AELT%24h%D1%07%3Aq%D4%EA%13%87%9A%7F"));
    }

    #[test]
    fn urlencodes_unreserved_bytes_verbatim() {
        assert_eq!(
            urlencode_bytes(b"AZaz09-._~"),
            "AZaz09-._~".to_string()
        );
        assert_eq!(urlencode_bytes(&[0x00, 0x20, 0xff]), "%00%20%FF");
    }

    #[test]
    fn rejects_invalid_announce_url() {
        let err = build_announce_url("::not a url::", &INFO_HASH, b"00112233445566778899", 6881, progress(0))
            .unwrap_err();
        assert!(matches!(err, TrackerError::ParseAnnounceUrl(_)));
    }

    #[test]
    fn parses_announce_response() {
        let body = b"d8:intervali1800e5:peers6:\x0a\x00\x00\x01\x1a\xe1e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].to_string(), "10.0.0.1:6881");
    }

    #[test]
    fn rejects_malformed_announce_response() {
        assert!(matches!(
            parse_announce_response(b"d5:peers6:\x0a\x00\x00\x01\x1a\xe1e"),
            Err(TrackerError::Convert {
                field: "interval",
                ..
            })
        ));
        assert!(matches!(
            parse_announce_response(b"d8:intervali1800e5:peers5:\x0a\x00\x00\x01\x1ae"),
            Err(TrackerError::Peers(PeerError::Parse(5)))
        ));
        assert!(matches!(
            parse_announce_response(b"le"),
            Err(TrackerError::Convert { .. })
        ));
    }
}
