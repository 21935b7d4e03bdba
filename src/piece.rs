//! # BitTorrent Piece Management
//!
//! Pieces are the verification units of the torrent data, typically
//! 256KB-1MB in size. They are downloaded in smaller blocks (16KB).
//!
//! - **PieceWork**: a piece waiting to be downloaded (index, hash, length)
//! - **PieceBuffer**: offset-indexed scratch area assembling one piece from
//!   blocks that may arrive in any order
//! - **PieceResult**: a downloaded piece whose SHA-1 digest matched
//! - **Completion**: per-index flags guaranteeing a piece is accepted once

use sha1::{Digest, Sha1};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Size of a SHA-1 digest in bytes
pub const SHA1_HASH_SIZE: usize = 20;

pub type PieceHash = [u8; SHA1_HASH_SIZE];

/// A piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 digest of the piece
    pub hash: PieceHash,
    /// Length of the piece in bytes
    pub length: u32,
}

/// A downloaded piece whose digest matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

/// Length of piece `index`: the nominal length except for the last piece,
/// which holds whatever remains of the file.
pub fn get_piece_length(index: u32, piece_length: u32, length: u64) -> u32 {
    let begin = get_piece_offset(index, piece_length);
    let end = (begin + piece_length as u64).min(length);
    end.saturating_sub(begin) as u32
}

/// Byte offset of piece `index` within the file.
pub fn get_piece_offset(index: u32, piece_length: u32) -> u64 {
    index as u64 * piece_length as u64
}

/// Builds one work item per piece hash.
pub fn build_work(hashes: &[PieceHash], piece_length: u32, length: u64) -> Vec<PieceWork> {
    hashes
        .iter()
        .enumerate()
        .map(|(index, hash)| PieceWork {
            index: index as u32,
            hash: *hash,
            length: get_piece_length(index as u32, piece_length, length),
        })
        .collect()
}

/// Checks a piece against its expected SHA-1 digest.
pub fn verify_piece(data: &[u8], hash: &PieceHash) -> bool {
    Sha1::digest(data).as_slice() == hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested,
    Received,
}

/// Assembly area for one in-flight piece.
///
/// Blocks are addressed by offset. A block is accepted only if it was
/// requested, not received yet, and has exactly the expected length.
#[derive(Debug)]
pub struct PieceBuffer {
    index: u32,
    block_size: u32,
    data: Vec<u8>,
    blocks: Vec<BlockState>,
    /// Requests sent and not answered yet
    backlog: u32,
    /// Bytes received so far
    downloaded: u32,
}

impl PieceBuffer {
    pub fn new(piece_work: &PieceWork, block_size: u32) -> PieceBuffer {
        let nb_blocks = (piece_work.length as usize).div_ceil(block_size as usize);
        PieceBuffer {
            index: piece_work.index,
            block_size,
            data: vec![0; piece_work.length as usize],
            blocks: vec![BlockState::Missing; nb_blocks],
            backlog: 0,
            downloaded: 0,
        }
    }

    fn block_length(&self, block: usize) -> u32 {
        let begin = block * self.block_size as usize;
        (self.data.len() - begin).min(self.block_size as usize) as u32
    }

    /// Picks the next missing block and marks it requested.
    ///
    /// Returns `(begin, length)` of the block, or `None` when every block is
    /// requested or received.
    pub fn next_request(&mut self) -> Option<(u32, u32)> {
        let block = self
            .blocks
            .iter()
            .position(|state| *state == BlockState::Missing)?;
        self.blocks[block] = BlockState::Requested;
        self.backlog += 1;
        Some((block as u32 * self.block_size, self.block_length(block)))
    }

    /// Stores a received block. Returns `false` if the block was not
    /// expected, in which case it is ignored.
    pub fn store(&mut self, index: u32, begin: u32, block: &[u8]) -> bool {
        if index != self.index || begin % self.block_size != 0 {
            return false;
        }
        let slot = (begin / self.block_size) as usize;
        if slot >= self.blocks.len()
            || self.blocks[slot] != BlockState::Requested
            || block.len() != self.block_length(slot) as usize
        {
            return false;
        }

        let begin = begin as usize;
        self.data[begin..begin + block.len()].copy_from_slice(block);
        self.blocks[slot] = BlockState::Received;
        self.backlog -= 1;
        self.downloaded += block.len() as u32;
        true
    }

    /// Forgets outstanding requests so they are sent again.
    ///
    /// A peer drops our pending requests when it chokes us.
    pub fn reset_requests(&mut self) {
        for state in self.blocks.iter_mut() {
            if *state == BlockState::Requested {
                *state = BlockState::Missing;
            }
        }
        self.backlog = 0;
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    #[cfg(test)]
    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded as usize == self.data.len()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Completion flags shared by every worker.
///
/// A piece index can be claimed once. The claim is an atomic check-and-set,
/// so two workers verifying the same piece cannot both deliver it.
#[derive(Debug)]
pub struct Completion {
    flags: Vec<AtomicBool>,
    completed: AtomicUsize,
}

impl Completion {
    pub fn new(nb_pieces: usize) -> Completion {
        Completion {
            flags: (0..nb_pieces).map(|_| AtomicBool::new(false)).collect(),
            completed: AtomicUsize::new(0),
        }
    }

    /// Claims a verified piece. Returns `true` for the first caller only.
    pub fn claim(&self, index: u32) -> bool {
        let flag = match self.flags.get(index as usize) {
            Some(flag) => flag,
            None => return false,
        };
        let won = flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        won
    }

    #[cfg(test)]
    pub fn is_claimed(&self, index: u32) -> bool {
        self.flags
            .get(index as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Number of pieces claimed so far. Never decreases.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.flags.len()
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.completed() == self.total()
    }
}
