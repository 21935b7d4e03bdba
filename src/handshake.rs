//! # BitTorrent Handshake Protocol
//!
//! The handshake is the first exchange on every peer connection. Both sides
//! must agree on the torrent (info hash) before any other message is sent.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (19)
//! - **pstr**: Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, no extension is advertised
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Identifier of the sender
//!
//! With the standard protocol string the frame is 68 bytes long.

use crate::error::PeerError;

const PROTOCOL_ID: &[u8] = b"BitTorrent protocol";
const RESERVED_LEN: usize = 8;
const HASH_LEN: usize = 20;

/// Bytes following the protocol string: reserved, info hash and peer id.
pub const HANDSHAKE_TAIL_LEN: usize = RESERVED_LEN + HASH_LEN + HASH_LEN;

/// Represents a BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier bytes
    pub pstr: Vec<u8>,
    /// Extension bits, all zeros when sent by this client
    pub reserved: [u8; RESERVED_LEN],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; HASH_LEN],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; HASH_LEN],
}

impl Handshake {
    /// Creates a handshake with the standard protocol string and zeroed
    /// reserved bytes.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.to_vec(),
            reserved: [0; RESERVED_LEN],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake for network transmission.
    ///
    /// Total size is always 49 + pstrlen bytes (68 bytes for standard protocol).
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(1 + self.pstr.len() + HANDSHAKE_TAIL_LEN);
        serialized.push(self.pstr.len() as u8);
        serialized.extend_from_slice(&self.pstr);
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);
        serialized
    }
}

/// Deserializes a received handshake.
///
/// `buf` holds everything after the leading `pstrlen` byte, that is
/// `pstrlen + 48` bytes.
///
/// # Errors
///
/// Returns [`PeerError::Handshake`] if `pstrlen` is zero or the buffer does
/// not have the expected size.
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Result<Handshake, PeerError> {
    if pstrlen == 0 {
        return Err(PeerError::Handshake("protocol string is empty".into()));
    }
    if buf.len() != pstrlen + HANDSHAKE_TAIL_LEN {
        return Err(PeerError::Handshake(format!(
            "expected {} bytes after pstrlen, got {}",
            pstrlen + HANDSHAKE_TAIL_LEN,
            buf.len()
        )));
    }

    let (pstr, rest) = buf.split_at(pstrlen);
    let (reserved, rest) = rest.split_at(RESERVED_LEN);
    let (info_hash, peer_id) = rest.split_at(HASH_LEN);

    let mut handshake = Handshake {
        pstr: pstr.to_vec(),
        reserved: [0; RESERVED_LEN],
        info_hash: [0; HASH_LEN],
        peer_id: [0; HASH_LEN],
    };
    handshake.reserved.copy_from_slice(reserved);
    handshake.info_hash.copy_from_slice(info_hash);
    handshake.peer_id.copy_from_slice(peer_id);

    Ok(handshake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_handshake_is_68_bytes() {
        let bytes = Handshake::new([1; 20], [2; 20]).serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[1; 20]);
        assert_eq!(&bytes[48..68], &[2; 20]);
    }

    #[test]
    fn deserialize_reads_fields_at_offsets() {
        let mut sent = Handshake::new([0xab; 20], [0xcd; 20]);
        sent.reserved[5] = 0x10;
        let bytes = sent.serialize();

        let received = deserialize_handshake(&bytes[1..], bytes[0] as usize).unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn deserialize_accepts_other_protocol_string_lengths() {
        let mut buf = b"abc".to_vec();
        buf.extend_from_slice(&[0; 8]);
        buf.extend_from_slice(&[3; 20]);
        buf.extend_from_slice(&[4; 20]);

        let handshake = deserialize_handshake(&buf, 3).unwrap();
        assert_eq!(handshake.pstr, b"abc");
        assert_eq!(handshake.info_hash, [3; 20]);
        assert_eq!(handshake.peer_id, [4; 20]);
    }

    #[test]
    fn deserialize_rejects_bad_sizes() {
        assert!(matches!(
            deserialize_handshake(&[0; 48], 0),
            Err(PeerError::Handshake(_))
        ));
        assert!(matches!(
            deserialize_handshake(&[0; 60], 19),
            Err(PeerError::Handshake(_))
        ));
    }
}
