//! # BitTorrent Torrent Metadata
//!
//! This module parses torrent files and ties the metadata to the tracker and
//! to the download engine.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tiers of tracker URLs (multitracker)
//! - **info**: Dictionary with file information and piece hashes
//! - **pieces**: Concatenated SHA-1 hashes for integrity verification
//! - **piece length**: Size of each piece (typically 256KB-1MB)
//! - **length**: Total file size
//! - **name**: Suggested filename
//!
//! The info hash identifying the torrent is the SHA-1 digest of the bencoded
//! info dictionary.

use crate::config::Config;
use crate::download::Download;
use crate::error::{DownloadError, TrackerError};
use crate::peer::Peer;
use crate::piece::{PieceHash, SHA1_HASH_SIZE};
use crate::tracker;

use anyhow::{anyhow, Context, Result};
use indicatif::ProgressBar;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use std::fs;
use std::path::Path;

/// Metadata of a single-file torrent.
#[derive(Debug, Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: [u8; 20],
    /// SHA-1 hashes, one for each piece
    pieces_hashes: Vec<PieceHash>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u64,
    /// Suggested filename from torrent metadata
    name: String,
}

/// BencodeInfo structure.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u64,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
    // Optional keys covered by the info hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5sum: Option<String>,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    // URL of the tracker
    #[serde(default)]
    announce: String,
    // Tiers of tracker URLs
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Informations about file
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hash bencoded informations to uniquely identify a file.
    fn hash(&self) -> Result<[u8; 20]> {
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(&Sha1::digest(&buf));
        Ok(hash)
    }

    /// Split bencoded pieces into SHA-1 hashes.
    fn split_pieces_hashes(&self) -> Result<Vec<PieceHash>> {
        if self.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!(
                "torrent is invalid: pieces length {} is not a multiple of {}",
                self.pieces.len(),
                SHA1_HASH_SIZE
            ));
        }

        Ok(self
            .pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|chunk| {
                let mut hash = [0; SHA1_HASH_SIZE];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

/// Generate a random 20-byte peer id.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0; 20];
    rand::thread_rng().fill(&mut peer_id[..]);
    peer_id
}

impl Torrent {
    /// Open and parse a torrent file.
    pub fn open(path: &Path) -> Result<Torrent> {
        let buf = fs::read(path)
            .with_context(|| format!("could not read torrent '{}'", path.display()))?;
        Torrent::from_bytes(&buf)
    }

    /// Parse bencoded torrent metadata.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let bencode = de::from_bytes::<BencodeTorrent>(buf).context("could not decode torrent")?;

        let tiers = if !bencode.announce_list.is_empty() {
            // Use announce-list, shuffle each tier as per BEP 12
            let mut tiers = bencode.announce_list;
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
            tiers
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce]]
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        };

        if bencode.info.piece_length == 0 {
            return Err(anyhow!("torrent is invalid: piece length is zero"));
        }

        let pieces_hashes = bencode.info.split_pieces_hashes()?;
        let expected = bencode.info.length.div_ceil(bencode.info.piece_length as u64);
        if expected != pieces_hashes.len() as u64 {
            return Err(anyhow!(
                "torrent is invalid: {} pieces hashes for {} pieces",
                pieces_hashes.len(),
                expected
            ));
        }

        Ok(Torrent {
            tiers,
            info_hash: bencode.info.hash()?,
            pieces_hashes,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name,
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    #[cfg(test)]
    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn nb_pieces(&self) -> usize {
        self.pieces_hashes.len()
    }

    /// Request peers from the torrent trackers.
    pub fn request_peers(&self, peer_id: &[u8; 20], port: u16) -> Result<Vec<Peer>, TrackerError> {
        tracker::request_peers(&self.tiers, &self.info_hash, peer_id, port, self.length)
    }

    /// Download the torrent content from `peers`.
    pub fn download(
        &self,
        peers: Vec<Peer>,
        peer_id: [u8; 20],
        config: &Config,
        progress: &ProgressBar,
    ) -> Result<Vec<u8>, DownloadError> {
        Download::new(
            peers,
            self.info_hash,
            peer_id,
            self.pieces_hashes.clone(),
            self.piece_length,
            self.length,
        )
        .run(config, progress)
    }
}
