//! # BitTorrent Peer Information
//!
//! This module defines the `Peer` structure and parses the compact peer list
//! returned by trackers.
//!
//! ## Compact Peer Format
//!
//! The compact format consists of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order (big-endian).

use byteorder::{BigEndian, ReadBytesExt};

use std::collections::HashSet;
use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const PEER_SIZE: usize = 6;

pub type PeerId = u32;

/// A remote endpoint of the swarm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Sequential identifier assigned for logging
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port number for connecting to the peer
    pub port: u16,
}

impl Peer {
    pub fn new(id: PeerId, ip: Ipv4Addr, port: u16) -> Peer {
        Peer { id, ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}:{})", self.id, self.ip, self.port)
    }
}

/// Parses a compact peer list into peers.
///
/// Returns `None` if the list length is not a multiple of 6 bytes.
pub fn parse_compact_peers(tracker_peers: &[u8]) -> Option<Vec<Peer>> {
    if tracker_peers.len() % PEER_SIZE != 0 {
        return None;
    }

    let mut peers = Vec::with_capacity(tracker_peers.len() / PEER_SIZE);
    for (i, entry) in tracker_peers.chunks_exact(PEER_SIZE).enumerate() {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = Cursor::new(&entry[4..6]).read_u16::<BigEndian>().ok()?;
        peers.push(Peer::new(i as PeerId, ip, port));
    }

    Some(peers)
}

/// Removes duplicate endpoints and renumbers peers sequentially.
pub fn dedup_peers(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    let mut deduped: Vec<Peer> = peers
        .into_iter()
        .filter(|peer| seen.insert((peer.ip, peer.port)))
        .collect();

    for (i, peer) in deduped.iter_mut().enumerate() {
        peer.id = i as PeerId;
    }
    deduped
}
