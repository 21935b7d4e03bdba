//! # Peer Availability Bitfield
//!
//! Compact representation of the pieces a peer claims to have:
//!
//! - Each byte represents 8 pieces
//! - Bit 7 (MSB) = piece index 0, bit 0 (LSB) = piece index 7
//! - Trailing bits in the last byte are zero
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ```

/// Highest piece count accepted from a peer, bounds the bitmap to 512 KiB.
pub const MAX_PIECES: u32 = 1 << 22;

/// Set of piece indices advertised by a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps the raw payload of a BITFIELD message.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Bitfield(bytes)
    }

    /// Checks if the piece is advertised. Out of range indices are absent.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.0.get(byte_index) {
            Some(&byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Marks a piece as available, growing the bitmap if needed.
    ///
    /// HAVE messages may arrive without a prior BITFIELD, so the bitmap starts
    /// empty and grows on demand. Indices past [`MAX_PIECES`] are ignored and
    /// `false` is returned.
    pub fn set_piece(&mut self, index: u32) -> bool {
        if index >= MAX_PIECES {
            return false;
        }
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.0.len() {
            self.0.resize(byte_index + 1, 0);
        }
        self.0[byte_index] |= 1u8 << (7 - offset);
        true
    }

    /// Number of pieces advertised.
    pub fn count(&self) -> u32 {
        self.0.iter().map(|byte| byte.count_ones()).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}
