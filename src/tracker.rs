//! # Tracker Announce
//!
//! Peer discovery over the HTTP tracker protocol.
//!
//! Every distinct tracker URL of every tier is announced to in parallel.
//! Peers returned by all trackers that answered are merged, duplicates are
//! removed and the survivors are numbered sequentially.
//!
//! ## Compact Responses
//!
//! Only compact peer lists are requested (`compact=1`): a byte string of
//! 6-byte entries, see [`parse_compact_peers`].

use crate::error::TrackerError;
use crate::peer::*;

use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

// Bound on a whole announce request
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// BencodeTracker structure.
#[derive(Debug, Deserialize)]
struct BencodeTracker {
    // Human-readable reason when the announce is refused
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: Option<u32>,
    // Peers IP addresses
    #[serde(default)]
    peers: Option<ByteBuf>,
}

/// Request peers from every tracker of every tier.
///
/// # Arguments
///
/// * `tiers` - Tracker tiers from the torrent, each a list of URLs.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - 20-byte string used as a unique ID for the client.
/// * `port` - Port number announced to the trackers.
/// * `left` - Number of bytes still to download.
///
pub fn request_peers(
    tiers: &[Vec<String>],
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Peer>, TrackerError> {
    // Flatten all tiers into a unique list of tracker URLs
    let mut seen = HashSet::new();
    let tracker_urls: Vec<&str> = tiers
        .iter()
        .flatten()
        .map(String::as_str)
        .filter(|url| seen.insert(*url))
        .collect();

    let responses: Vec<(&str, Result<Vec<Peer>, TrackerError>)> = thread::scope(|scope| {
        let handles: Vec<_> = tracker_urls
            .iter()
            .map(|&announce| {
                let handle =
                    scope.spawn(move || announce_to(announce, info_hash, peer_id, port, left));
                (announce, handle)
            })
            .collect();

        handles
            .into_iter()
            .filter_map(|(announce, handle)| handle.join().ok().map(|result| (announce, result)))
            .collect()
    });

    let mut all_peers = Vec::new();
    let mut first_error = None;
    for (announce, response) in responses {
        match response {
            Ok(mut peers) => {
                info!("Tracker {} returned {} peers", announce, peers.len());
                all_peers.append(&mut peers);
            }
            Err(e) => {
                warn!("Tracker {} failed: {}", announce, e);
                first_error.get_or_insert(e);
            }
        }
    }

    if all_peers.is_empty() {
        return Err(first_error.unwrap_or(TrackerError::NoPeers));
    }

    Ok(dedup_peers(all_peers))
}

fn announce_to(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<Vec<Peer>, TrackerError> {
    let url = build_tracker_url(announce, info_hash, peer_id, port, left)?;
    debug!("Announcing to {}", announce);

    let client = reqwest::blocking::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()?;
    let response = client.get(&url).send()?.error_for_status()?.bytes()?;

    parse_tracker_response(&response)
}

/// Decodes a bencoded announce response into its peers.
pub fn parse_tracker_response(buf: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    let tracker_bencode = de::from_bytes::<BencodeTracker>(buf)?;

    if let Some(reason) = tracker_bencode.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    if let Some(interval) = tracker_bencode.interval {
        debug!("Tracker asks to announce again in {}s", interval);
    }

    let peers = tracker_bencode.peers.unwrap_or_default();
    parse_compact_peers(&peers).ok_or(TrackerError::MalformedPeers)
}

/// Build tracker URL.
///
/// # Arguments
///
/// * `announce` - The tracker URL.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - 20-byte string used as a unique ID for the client.
/// * `port` - Port number that the client is listening on.
/// * `left` - Number of bytes still to download.
///
pub fn build_tracker_url(
    announce: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String, TrackerError> {
    let base_url = Url::parse(announce)?;

    // Binary values are encoded byte by byte, Url would treat them as UTF-8
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        left
    );

    let mut url = base_url.to_string();
    url.push(if base_url.query().is_some() { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Each byte is encoded as %XX where XX is the hexadecimal representation
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}
