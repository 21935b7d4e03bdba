//! Scripted in-process peers used by the tests.

use crate::handshake::Handshake;
use crate::message::{Message, LENGTH_PREFIX_LEN};
use crate::peer::Peer;

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// How a mock seeder deviates from the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Serves every request correctly.
    Honest,
    /// Answers the handshake with another info hash.
    WrongInfoHash,
    /// Never unchokes.
    NeverUnchoke,
    /// Answers the first request with a frame declaring more bytes than it
    /// sends, then hangs up.
    Truncate,
    /// Flips one bit in every block it serves.
    Corrupt,
    /// Accepts requests but never answers them.
    Stall,
    /// Answers the first request with a keep-alive every 100 ms, forever.
    KeepAlive,
}

/// A fake peer serving the given pieces.
#[derive(Clone, Debug)]
pub struct Seeder {
    pub info_hash: [u8; 20],
    pub pieces: Vec<Vec<u8>>,
    /// Indices advertised in the bitfield, all pieces when `None`.
    pub advertised: Option<Vec<u32>>,
    pub behavior: Behavior,
}

impl Seeder {
    pub fn new(info_hash: [u8; 20], pieces: Vec<Vec<u8>>) -> Seeder {
        Seeder {
            info_hash,
            pieces,
            advertised: None,
            behavior: Behavior::Honest,
        }
    }

    pub fn behaving(mut self, behavior: Behavior) -> Seeder {
        self.behavior = behavior;
        self
    }

    pub fn advertising(mut self, indices: Vec<u32>) -> Seeder {
        self.advertised = Some(indices);
        self
    }

    /// Listens on an ephemeral local port and serves one connection in a
    /// background thread.
    pub fn spawn(self, id: u32) -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));
                self.serve(stream);
            }
        });
        Peer::new(id, Ipv4Addr::LOCALHOST, port)
    }

    fn bitfield(&self) -> Vec<u8> {
        let mut bitfield = vec![0; (self.pieces.len() + 7) / 8];
        let all: Vec<u32> = (0..self.pieces.len() as u32).collect();
        for &index in self.advertised.as_ref().unwrap_or(&all) {
            bitfield[index as usize / 8] |= 1u8 << (7 - index % 8);
        }
        bitfield
    }

    fn serve(self, mut stream: TcpStream) {
        let mut handshake = [0; 68];
        if stream.read_exact(&mut handshake).is_err() {
            return;
        }
        let info_hash = match self.behavior {
            Behavior::WrongInfoHash => [0xee; 20],
            _ => self.info_hash,
        };
        let reply = Handshake::new(info_hash, [0x5e; 20]).serialize();
        if stream.write_all(&reply).is_err() || self.behavior == Behavior::WrongInfoHash {
            return;
        }
        if stream
            .write_all(&Message::Bitfield(self.bitfield()).serialize())
            .is_err()
        {
            return;
        }

        while let Some(message) = read_frame(&mut stream) {
            let reply = match message {
                Message::Interested if self.behavior != Behavior::NeverUnchoke => {
                    Message::Unchoke.serialize()
                }
                Message::Request {
                    index,
                    begin,
                    length,
                } => match self.behavior {
                    Behavior::Stall => continue,
                    Behavior::KeepAlive => loop {
                        thread::sleep(Duration::from_millis(100));
                        if stream.write_all(&Message::KeepAlive.serialize()).is_err() {
                            return;
                        }
                    },
                    Behavior::Truncate => {
                        let _ = stream.write_all(&[0, 0, 0, 50, 7, 0, 0]);
                        return;
                    }
                    _ => {
                        let piece = &self.pieces[index as usize];
                        let begin = begin as usize;
                        let mut block = piece[begin..begin + length as usize].to_vec();
                        if self.behavior == Behavior::Corrupt {
                            block[0] ^= 1;
                        }
                        Message::Piece {
                            index,
                            begin: begin as u32,
                            block,
                        }
                        .serialize()
                    }
                },
                _ => continue,
            };
            if stream.write_all(&reply).is_err() {
                return;
            }
        }
    }
}

fn read_frame(stream: &mut TcpStream) -> Option<Message> {
    let mut prefix = [0; LENGTH_PREFIX_LEN];
    stream.read_exact(&mut prefix).ok()?;
    let len = u32::from_be_bytes(prefix) as usize;
    let mut frame = prefix.to_vec();
    frame.resize(LENGTH_PREFIX_LEN + len, 0);
    stream.read_exact(&mut frame[LENGTH_PREFIX_LEN..]).ok()?;
    Message::deserialize(&frame).ok()
}

/// A local endpoint that refuses connections.
pub fn closed_port() -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Peer::new(99, Ipv4Addr::LOCALHOST, port)
}
