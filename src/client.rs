//! # BitTorrent Peer Client
//!
//! This module implements the client side of the peer wire protocol for a
//! single remote peer: TCP connection, handshake, and framed message exchange.
//!
//! ## Protocol Overview
//!
//! 1. **Handshake**: Both sides confirm they serve the same info hash
//! 2. **Bitfield Exchange**: The peer advertises which pieces it has
//! 3. **Choke/Unchoke Management**: The peer tells us when requests are allowed
//! 4. **Piece Requests / Transfer**: Blocks are requested and received
//!
//! ## Session State
//!
//! Every message read through [`Client::read_message`] is applied to the
//! session before being returned:
//!
//! - CHOKE / UNCHOKE toggle the choke flag (choked until told otherwise)
//! - BITFIELD replaces the availability bitmap
//! - HAVE marks one more piece as available
//!
//! ## Timeouts
//!
//! Every read and write is bounded by the socket timeouts. An expired
//! timeout surfaces as [`PeerError::Timeout`].

use crate::bitfield::*;
use crate::error::PeerError;
use crate::handshake::*;
use crate::message::*;
use crate::peer::*;

use byteorder::{BigEndian, ReadBytesExt};

use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Connection to a remote BitTorrent peer.
///
/// A client is owned by exactly one worker. Its socket is shut down when it
/// is dropped, whatever the reason the worker stopped.
pub struct Client {
    /// Remote endpoint
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Pieces the peer claims to have
    bitfield: Bitfield,
    /// Whether the peer refuses our requests
    choked: bool,
}

impl Client {
    /// Opens a TCP connection to the peer.
    ///
    /// The same `timeout` bounds the connection attempt and, until changed
    /// with [`Client::set_connection_timeout`], every read and write.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Connect`] if the peer is unreachable or refuses
    /// the connection.
    pub fn connect(peer: Peer, timeout: Duration) -> Result<Client, PeerError> {
        let conn =
            TcpStream::connect_timeout(&peer.socket_addr(), timeout).map_err(PeerError::Connect)?;

        let client = Client {
            peer,
            conn,
            bitfield: Bitfield::new(),
            choked: true,
        };
        client.set_connection_timeout(timeout)?;

        debug!("Connected to peer {}", client.peer);

        Ok(client)
    }

    /// Returns whether the peer currently refuses our requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Checks if the peer advertised a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Sets read and write timeouts on the TCP connection.
    pub fn set_connection_timeout(&self, timeout: Duration) -> Result<(), PeerError> {
        self.conn.set_write_timeout(Some(timeout))?;
        self.conn.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Performs the BitTorrent handshake.
    ///
    /// Sends our handshake, reads the peer's one, and checks that the peer
    /// serves the same info hash.
    ///
    /// # Returns
    ///
    /// The 20-byte peer id the remote peer claims.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Timeout`] if the peer does not answer in time
    /// - [`PeerError::Handshake`] if the answer is malformed or is for
    ///   another torrent
    pub fn handshake(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<[u8; 20], PeerError> {
        let handshake = Handshake::new(*info_hash, *peer_id);
        self.conn
            .write_all(&handshake.serialize())
            .map_err(PeerError::from_frame_io)?;

        let handshake_len = self.read_handshake_len()?;
        let mut handshake_buf: Vec<u8> = vec![0; handshake_len + HANDSHAKE_TAIL_LEN];
        self.conn
            .read_exact(&mut handshake_buf)
            .map_err(handshake_io)?;

        let received = deserialize_handshake(&handshake_buf, handshake_len)?;
        if received.info_hash != *info_hash {
            return Err(PeerError::Handshake(format!(
                "peer {} serves another torrent",
                self.peer
            )));
        }

        debug!("Handshake completed with peer {}", self.peer);

        Ok(received.peer_id)
    }

    /// Reads the first handshake byte: the protocol string length.
    fn read_handshake_len(&mut self) -> Result<usize, PeerError> {
        let mut buf = [0; 1];
        self.conn.read_exact(&mut buf).map_err(handshake_io)?;

        if buf[0] == 0 {
            return Err(PeerError::Handshake(
                "invalid handshake length received from peer".into(),
            ));
        }

        Ok(buf[0] as usize)
    }

    /// Reads one message and applies it to the session state.
    ///
    /// # Errors
    ///
    /// - [`PeerError::Timeout`] if no complete frame arrives in time
    /// - [`PeerError::MalformedFrame`] if the frame is oversized, truncated,
    ///   or its payload does not fit its message type
    pub fn read_message(&mut self) -> Result<Message, PeerError> {
        let message_len = self.read_message_len()?;

        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {}", self.peer);
            return Ok(Message::KeepAlive);
        }
        if message_len > MAX_FRAME_LEN {
            return Err(PeerError::MalformedFrame(format!(
                "frame of {} bytes exceeds the {} bytes limit",
                message_len, MAX_FRAME_LEN
            )));
        }

        let mut frame: Vec<u8> = vec![0; LENGTH_PREFIX_LEN + message_len];
        frame[..LENGTH_PREFIX_LEN].copy_from_slice(&(message_len as u32).to_be_bytes());
        self.conn
            .read_exact(&mut frame[LENGTH_PREFIX_LEN..])
            .map_err(PeerError::from_frame_io)?;

        let message = Message::deserialize(&frame)?;
        self.apply(&message);

        Ok(message)
    }

    /// Reads the 4-byte length prefix of an incoming message.
    fn read_message_len(&mut self) -> Result<usize, PeerError> {
        let mut buf = [0; LENGTH_PREFIX_LEN];
        self.conn.read_exact(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                // clean close between two frames
                PeerError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "peer closed the connection",
                ))
            } else {
                PeerError::from_frame_io(e)
            }
        })?;

        let mut cursor = Cursor::new(buf);
        Ok(cursor.read_u32::<BigEndian>()? as usize)
    }

    /// Updates choke state and availability from a received message.
    fn apply(&mut self, message: &Message) {
        match message {
            Message::Choke => {
                debug!("Receive MESSAGE_CHOKE from peer {}", self.peer);
                self.choked = true;
            }
            Message::Unchoke => {
                debug!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
                self.choked = false;
            }
            Message::Have(index) => {
                debug!("Receive MESSAGE_HAVE {} from peer {}", index, self.peer);
                if !self.bitfield.set_piece(*index) {
                    debug!("Ignore out of range piece {} from peer {}", index, self.peer);
                }
            }
            Message::Bitfield(bytes) => {
                self.bitfield = Bitfield::from_bytes(bytes.clone());
                debug!(
                    "Receive MESSAGE_BITFIELD from peer {} ({} pieces)",
                    self.peer,
                    self.bitfield.count()
                );
            }
            Message::Unknown { id, .. } => {
                debug!("Ignore unknown message {} from peer {}", id, self.peer);
            }
            _ => {}
        }
    }

    /// Sends a message to the peer.
    pub fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.conn
            .write_all(&message.serialize())
            .map_err(PeerError::from_frame_io)
    }

    /// Signals that we accept requests from the peer.
    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        debug!("Send MESSAGE_UNCHOKE to peer {}", self.peer);
        self.send_message(&Message::Unchoke)
    }

    /// Signals that we want to download from the peer.
    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        debug!("Send MESSAGE_INTERESTED to peer {}", self.peer);
        self.send_message(&Message::Interested)
    }

    /// Notifies the peer that we now have a piece.
    pub fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        debug!("Send MESSAGE_HAVE {} to peer {}", index, self.peer);
        self.send_message(&Message::Have(index))
    }

    /// Requests a block of `length` bytes at `begin` within piece `index`.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        debug!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send_message(&Message::Request {
            index,
            begin,
            length,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.conn.shutdown(Shutdown::Both) {
            // already closed by the peer
            debug!("Shutdown of connection to peer {}: {}", self.peer, e);
        }
        debug!("Disconnected from peer {}", self.peer);
    }
}

fn handshake_io(err: io::Error) -> PeerError {
    match PeerError::from_frame_io(err) {
        PeerError::Timeout => PeerError::Timeout,
        other => PeerError::Handshake(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    const INFO_HASH: [u8; 20] = [7; 20];
    const PEER_ID: [u8; 20] = [1; 20];
    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Accepts one connection and runs `script` against it.
    fn scripted_peer<F>(script: F) -> (Peer, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(TIMEOUT)).unwrap();
            script(stream);
        });
        (Peer::new(0, Ipv4Addr::LOCALHOST, port), handle)
    }

    fn answer_handshake(stream: &mut TcpStream, info_hash: [u8; 20]) {
        let mut buf = [0; 68];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[28..48], &INFO_HASH);
        assert_eq!(&buf[48..68], &PEER_ID);
        stream
            .write_all(&Handshake::new(info_hash, [9; 20]).serialize())
            .unwrap();
    }

    #[test]
    fn handshake_returns_remote_peer_id() {
        let (peer, handle) = scripted_peer(|mut stream| answer_handshake(&mut stream, INFO_HASH));

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        assert!(client.is_choked());
        assert_eq!(client.handshake(&INFO_HASH, &PEER_ID).unwrap(), [9; 20]);
        handle.join().unwrap();
    }

    #[test]
    fn handshake_rejects_other_torrent() {
        let (peer, handle) = scripted_peer(|mut stream| answer_handshake(&mut stream, [8; 20]));

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        assert!(matches!(
            client.handshake(&INFO_HASH, &PEER_ID),
            Err(PeerError::Handshake(_))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn handshake_rejects_truncated_answer() {
        let (peer, handle) = scripted_peer(|mut stream| {
            let mut buf = [0; 68];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&[19, b'B', b'i']).unwrap();
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        assert!(matches!(
            client.handshake(&INFO_HASH, &PEER_ID),
            Err(PeerError::Handshake(_))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn messages_update_session_state() {
        let (peer, handle) = scripted_peer(|mut stream| {
            answer_handshake(&mut stream, INFO_HASH);
            stream
                .write_all(&Message::Bitfield(vec![0b1000_0000]).serialize())
                .unwrap();
            stream.write_all(&Message::Have(3).serialize()).unwrap();
            stream.write_all(&Message::KeepAlive.serialize()).unwrap();
            stream.write_all(&Message::Unchoke.serialize()).unwrap();
            stream.write_all(&[0, 0, 0, 2, 42, 0]).unwrap();
            stream.write_all(&Message::Choke.serialize()).unwrap();
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        client.handshake(&INFO_HASH, &PEER_ID).unwrap();

        client.read_message().unwrap();
        assert!(client.has_piece(0));
        assert!(!client.has_piece(3));

        assert_eq!(client.read_message().unwrap(), Message::Have(3));
        assert!(client.has_piece(3));

        assert_eq!(client.read_message().unwrap(), Message::KeepAlive);

        assert_eq!(client.read_message().unwrap(), Message::Unchoke);
        assert!(!client.is_choked());

        assert!(matches!(
            client.read_message().unwrap(),
            Message::Unknown { id: 42, .. }
        ));

        assert_eq!(client.read_message().unwrap(), Message::Choke);
        assert!(client.is_choked());
        handle.join().unwrap();
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let (peer, handle) = scripted_peer(|mut stream| {
            answer_handshake(&mut stream, INFO_HASH);
            // declares 13 bytes, sends 5 and closes
            stream.write_all(&[0, 0, 0, 13, 7, 0, 0, 0, 0]).unwrap();
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        client.handshake(&INFO_HASH, &PEER_ID).unwrap();
        handle.join().unwrap();
        assert!(matches!(
            client.read_message(),
            Err(PeerError::MalformedFrame(_))
        ));
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let (peer, handle) = scripted_peer(|mut stream| {
            answer_handshake(&mut stream, INFO_HASH);
            stream.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        client.handshake(&INFO_HASH, &PEER_ID).unwrap();
        assert!(matches!(
            client.read_message(),
            Err(PeerError::MalformedFrame(_))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn silent_peer_times_out() {
        let (peer, handle) = scripted_peer(|mut stream| {
            answer_handshake(&mut stream, INFO_HASH);
            // wait for the client to give up
            let mut buf = [0; 1];
            let _ = stream.read(&mut buf);
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        client.handshake(&INFO_HASH, &PEER_ID).unwrap();
        client
            .set_connection_timeout(Duration::from_millis(100))
            .unwrap();
        assert!(matches!(client.read_message(), Err(PeerError::Timeout)));
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn refused_connection_is_connect_error() {
        let peer = mock::closed_port();
        assert!(matches!(
            Client::connect(peer, TIMEOUT),
            Err(PeerError::Connect(_))
        ));
    }

    #[test]
    fn requests_are_framed_on_the_wire() {
        let (peer, handle) = scripted_peer(|mut stream| {
            answer_handshake(&mut stream, INFO_HASH);
            let mut buf = [0; 17 + 5];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(
                Message::deserialize(&buf[..17]).unwrap(),
                Message::Request {
                    index: 2,
                    begin: 16384,
                    length: 100,
                }
            );
            assert_eq!(Message::deserialize(&buf[17..]).unwrap(), Message::Interested);
        });

        let mut client = Client::connect(peer, TIMEOUT).unwrap();
        client.handshake(&INFO_HASH, &PEER_ID).unwrap();
        client.send_request(2, 16384, 100).unwrap();
        client.send_interested().unwrap();
        handle.join().unwrap();
    }
}
