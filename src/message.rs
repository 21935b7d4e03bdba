//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and their binary framing for the
//! BitTorrent peer wire protocol. Every exchange after the handshake uses
//! these frames.
//!
//! ## Frame Structure
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! A frame with length 0 is a keep-alive and carries neither ID nor payload.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | availability bitmap |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block |
//! | 8 | CANCEL | index, begin, length |
//!
//! Any other ID decodes to [`Message::Unknown`] so that protocol extensions
//! can be skipped instead of tearing the connection down.

use crate::error::PeerError;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// Size of the length prefix of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame body accepted from a peer: a 128 KiB block plus a piece header.
pub const MAX_FRAME_LEN: usize = (1 << 17) + 13;

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A message with an ID this client does not implement.
    Unknown { id: MessageId, payload: Vec<u8> },
}

impl Message {
    /// Message ID on the wire, `None` for keep-alives.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MESSAGE_CHOKE),
            Message::Unchoke => Some(MESSAGE_UNCHOKE),
            Message::Interested => Some(MESSAGE_INTERESTED),
            Message::NotInterested => Some(MESSAGE_NOT_INTERESTED),
            Message::Have(_) => Some(MESSAGE_HAVE),
            Message::Bitfield(_) => Some(MESSAGE_BITFIELD),
            Message::Request { .. } => Some(MESSAGE_REQUEST),
            Message::Piece { .. } => Some(MESSAGE_PIECE),
            Message::Cancel { .. } => Some(MESSAGE_CANCEL),
            Message::Unknown { id, .. } => Some(*id),
        }
    }

    /// Serialize message into a complete frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = vec![];
        match self {
            Message::KeepAlive => return vec![0; LENGTH_PREFIX_LEN],
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) => put_u32(&mut payload, *index),
            Message::Bitfield(bitfield) => payload.extend_from_slice(bitfield),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_u32(&mut payload, *index);
                put_u32(&mut payload, *begin);
                put_u32(&mut payload, *length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                put_u32(&mut payload, *index);
                put_u32(&mut payload, *begin);
                payload.extend_from_slice(block);
            }
            Message::Unknown { payload: p, .. } => payload.extend_from_slice(p),
        }

        let mut serialized: Vec<u8> = Vec::with_capacity(LENGTH_PREFIX_LEN + 1 + payload.len());
        put_u32(&mut serialized, 1 + payload.len() as u32);
        // keep-alive returned early, every other variant has an id
        serialized.push(self.id().unwrap_or_default());
        serialized.append(&mut payload);
        serialized
    }

    /// Deserialize a complete frame, length prefix included.
    ///
    /// The declared length must match the number of bytes that follow it
    /// exactly, otherwise the frame is malformed.
    pub fn deserialize(frame: &[u8]) -> Result<Message, PeerError> {
        if frame.len() < LENGTH_PREFIX_LEN {
            return Err(PeerError::MalformedFrame(format!(
                "frame of {} bytes is shorter than its length prefix",
                frame.len()
            )));
        }

        let mut cursor = Cursor::new(&frame[..LENGTH_PREFIX_LEN]);
        let declared = cursor.read_u32::<BigEndian>()? as usize;
        let body = &frame[LENGTH_PREFIX_LEN..];
        if declared != body.len() {
            return Err(PeerError::MalformedFrame(format!(
                "declared length {} but {} bytes available",
                declared,
                body.len()
            )));
        }

        if declared == 0 {
            return Ok(Message::KeepAlive);
        }
        deserialize_message(body)
    }
}

/// Deserialize a frame body (message ID followed by its payload).
///
/// # Arguments
///
/// * `body` - The bytes following the length prefix.
///
pub fn deserialize_message(body: &[u8]) -> Result<Message, PeerError> {
    let (&id, payload) = match body.split_first() {
        Some(split) => split,
        None => return Ok(Message::KeepAlive),
    };

    let message = match id {
        MESSAGE_CHOKE => expect_empty(id, payload, Message::Choke)?,
        MESSAGE_UNCHOKE => expect_empty(id, payload, Message::Unchoke)?,
        MESSAGE_INTERESTED => expect_empty(id, payload, Message::Interested)?,
        MESSAGE_NOT_INTERESTED => expect_empty(id, payload, Message::NotInterested)?,
        MESSAGE_HAVE => {
            expect_len(id, payload, 4)?;
            Message::Have(read_u32(payload, 0)?)
        }
        MESSAGE_BITFIELD => Message::Bitfield(payload.to_vec()),
        MESSAGE_REQUEST | MESSAGE_CANCEL => {
            expect_len(id, payload, 12)?;
            let index = read_u32(payload, 0)?;
            let begin = read_u32(payload, 4)?;
            let length = read_u32(payload, 8)?;
            if id == MESSAGE_REQUEST {
                Message::Request {
                    index,
                    begin,
                    length,
                }
            } else {
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
        }
        MESSAGE_PIECE => {
            if payload.len() < 8 {
                return Err(PeerError::MalformedFrame(format!(
                    "piece payload of {} bytes has no header",
                    payload.len()
                )));
            }
            Message::Piece {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                block: payload[8..].to_vec(),
            }
        }
        _ => Message::Unknown {
            id,
            payload: payload.to_vec(),
        },
    };

    Ok(message)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    // writing into a Vec cannot fail
    let _ = buf.write_u32::<BigEndian>(value);
}

fn read_u32(payload: &[u8], offset: usize) -> Result<u32, PeerError> {
    let mut cursor = Cursor::new(&payload[offset..offset + 4]);
    Ok(cursor.read_u32::<BigEndian>()?)
}

fn expect_len(id: MessageId, payload: &[u8], len: usize) -> Result<(), PeerError> {
    if payload.len() != len {
        return Err(PeerError::MalformedFrame(format!(
            "message {} expects a {}-byte payload, got {}",
            id,
            len,
            payload.len()
        )));
    }
    Ok(())
}

fn expect_empty(id: MessageId, payload: &[u8], message: Message) -> Result<Message, PeerError> {
    expect_len(id, payload, 0)?;
    Ok(message)
}
