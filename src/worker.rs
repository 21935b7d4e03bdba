//! # BitTorrent Worker Thread
//!
//! This module implements the worker thread that downloads from a single peer.
//!
//! ## Worker Architecture
//!
//! - **One worker per peer**: each peer gets its own thread and connection
//! - **Shared work queue**: pieces are checked out, then finished or pushed back
//! - **Event channel**: verified pieces are handed to the orchestrator
//!
//! ## Download Process
//!
//! 1. **Connection**: Establish TCP connection and perform handshake
//! 2. **Choke Management**: Declare interest and wait to be unchoked
//! 3. **Piece Requests**: Request blocks in parallel (pipelined)
//! 4. **Data Assembly**: Collect blocks into a complete piece
//! 5. **Verification**: SHA-1 check against the torrent metadata
//! 6. **Result Reporting**: Claim the piece and send it to the orchestrator
//!
//! ## Error Handling
//!
//! A worker never reconnects. Any connection error, or a piece failing
//! verification, ends the worker after its piece is pushed back to the queue
//! for another peer to download.

use crate::client::*;
use crate::config::Config;
use crate::error::PeerError;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;
use crate::queue::WorkQueue;

use crossbeam_channel::Sender;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Notification sent from a worker to the orchestrator.
#[derive(Debug)]
pub enum Event {
    /// The peer completed the handshake.
    Connected(PeerId),
    /// A piece was verified and claimed by this worker.
    Piece(PieceResult),
}

/// Why a worker stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// No work left.
    Drained,
    /// The download is over or was abandoned.
    Cancelled,
    /// The peer lacks every piece still pending.
    NothingToOffer,
}

/// State shared by every worker of a download.
pub struct Swarm<'a> {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub config: &'a Config,
    pub queue: &'a WorkQueue,
    pub completion: &'a Completion,
    pub cancel: &'a AtomicBool,
}

/// Downloads pieces from a single peer.
pub struct Worker<'a> {
    /// Remote peer served by this worker
    peer: Peer,
    swarm: &'a Swarm<'a>,
    /// Channel to the orchestrator
    events: Sender<Event>,
}

impl<'a> Worker<'a> {
    pub fn new(peer: Peer, swarm: &'a Swarm<'a>, events: Sender<Event>) -> Worker<'a> {
        Worker {
            peer,
            swarm,
            events,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.swarm.cancel.load(Ordering::Acquire)
    }

    /// Runs the worker until the queue is drained, the download is
    /// cancelled, or the peer fails.
    pub fn start_download(self) {
        let pid = self.peer.clone();
        match self.run() {
            Ok(exit) => debug!("Worker for peer {} exiting: {:?}", pid, exit),
            Err(PeerError::Connect(e)) => debug!("Could not connect to peer {}: {}", pid, e),
            Err(e) => warn!("Dropping peer {}: {}", pid, e),
        }
    }

    fn run(&self) -> Result<Exit, PeerError> {
        let config = self.swarm.config;

        debug!("Attempting to connect to peer {}", self.peer);
        let mut client = Client::connect(self.peer.clone(), config.connect_timeout)?;
        let remote_id = client.handshake(&self.swarm.info_hash, &self.swarm.peer_id)?;
        debug!(
            "Peer {} identifies as {}",
            self.peer,
            String::from_utf8_lossy(&remote_id)
        );
        client.set_connection_timeout(config.message_timeout)?;

        info!("Connected to peer {}", self.peer);
        if self.events.send(Event::Connected(self.peer.id)).is_err() {
            return Ok(Exit::Cancelled);
        }

        client.send_unchoke()?;
        client.send_interested()?;
        if !self.wait_unchoke(&mut client)? {
            return Ok(Exit::Cancelled);
        }

        let mut skips = 0;
        loop {
            if self.is_cancelled() {
                return Ok(Exit::Cancelled);
            }

            let piece_work = match self.swarm.queue.pop() {
                Some(piece_work) => piece_work,
                None => return Ok(Exit::Drained),
            };

            // Skip pieces the peer does not advertise
            if !client.has_piece(piece_work.index) {
                self.swarm.queue.push(piece_work);
                skips += 1;
                if skips >= config.max_skips {
                    return Ok(Exit::NothingToOffer);
                }
                continue;
            }

            let data = match self.download_piece(&mut client, &piece_work) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    self.swarm.queue.push(piece_work);
                    return Ok(Exit::Cancelled);
                }
                Err(e) => {
                    self.swarm.queue.push(piece_work);
                    return Err(e);
                }
            };

            if !verify_piece(&data, &piece_work.hash) {
                let index = piece_work.index;
                self.swarm.queue.push(piece_work);
                return Err(PeerError::IntegrityMismatch(index));
            }
            skips = 0;

            debug!(
                "Successfully verified integrity of piece {} from peer {}",
                piece_work.index, self.peer
            );

            if self.swarm.completion.claim(piece_work.index) {
                let result = PieceResult {
                    index: piece_work.index,
                    data,
                };
                if self.events.send(Event::Piece(result)).is_err() {
                    self.swarm.queue.finish();
                    return Ok(Exit::Cancelled);
                }
            } else {
                debug!("Discarding duplicate piece {}", piece_work.index);
            }
            self.swarm.queue.finish();

            // Best effort, the peer may use it to update its view of the swarm
            if let Err(e) = client.send_have(piece_work.index) {
                debug!("Could not send MESSAGE_HAVE to peer {}: {}", self.peer, e);
            }
        }
    }

    /// Reads messages until the peer unchokes us.
    ///
    /// Returns `false` if the download was cancelled meanwhile.
    fn wait_unchoke(&self, client: &mut Client) -> Result<bool, PeerError> {
        let deadline = Instant::now() + self.swarm.config.unchoke_timeout;
        while client.is_choked() {
            if self.is_cancelled() {
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Err(PeerError::Timeout);
            }
            client.read_message()?;
        }

        debug!(
            "Peer {} unchoked us, {} pieces advertised",
            self.peer,
            client.bitfield().count()
        );
        Ok(true)
    }

    /// Downloads one piece with pipelined block requests.
    ///
    /// Returns `None` if the download was cancelled meanwhile.
    fn download_piece(
        &self,
        client: &mut Client,
        piece_work: &PieceWork,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let config = self.swarm.config;
        let mut buffer = PieceBuffer::new(piece_work, config.block_size);
        let mut choked_since = if client.is_choked() {
            Some(Instant::now())
        } else {
            None
        };
        // Only accepted blocks count as progress, keep-alives and other
        // chatter do not. `idle_since` also restarts on unchoke, `last_block`
        // bounds a peer flapping between choke and unchoke.
        let mut idle_since = Instant::now();
        let mut last_block = Instant::now();
        let stall_limit = config.message_timeout + config.unchoke_timeout;

        while !buffer.is_complete() {
            if self.is_cancelled() {
                return Ok(None);
            }
            if last_block.elapsed() >= stall_limit {
                return Err(PeerError::Timeout);
            }

            // If client is unchoked by peer, fill the pipeline
            if !client.is_choked() {
                while buffer.backlog() < config.pipeline_depth {
                    match buffer.next_request() {
                        Some((begin, length)) => {
                            client.send_request(piece_work.index, begin, length)?
                        }
                        None => break,
                    }
                }
                if idle_since.elapsed() >= config.message_timeout {
                    return Err(PeerError::Timeout);
                }
            } else if choked_since.is_some_and(|since| since.elapsed() >= config.unchoke_timeout) {
                return Err(PeerError::Timeout);
            }

            match client.read_message()? {
                Message::Choke => {
                    warn!("Peer {} choked us, waiting for unchoke...", self.peer);
                    buffer.reset_requests();
                    choked_since = Some(Instant::now());
                }
                Message::Unchoke => {
                    debug!("Peer {} unchoked us, resuming downloads", self.peer);
                    choked_since = None;
                    idle_since = Instant::now();
                }
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    if buffer.store(index, begin, &block) {
                        idle_since = Instant::now();
                        last_block = idle_since;
                        debug!(
                            "Download piece {} [{}:{}] from peer {}",
                            index,
                            begin,
                            begin as usize + block.len(),
                            self.peer
                        );
                    } else {
                        debug!(
                            "Ignoring unexpected block of piece {} at {} from peer {}",
                            index, begin, self.peer
                        );
                    }
                }
                _ => {}
            }
        }

        debug!(
            "Successfully downloaded piece {} from peer {}",
            piece_work.index, self.peer
        );

        Ok(Some(buffer.into_data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{closed_port, Behavior, Seeder};

    use crossbeam_channel::unbounded;
    use sha1::Digest;
    use std::time::Duration;

    const INFO_HASH: [u8; 20] = [0x11; 20];

    fn test_config() -> Config {
        Config {
            connect_timeout: Duration::from_secs(2),
            message_timeout: Duration::from_millis(500),
            unchoke_timeout: Duration::from_millis(500),
            block_size: 2,
            pipeline_depth: 2,
            max_skips: 3,
            port: 6881,
        }
    }

    fn pieces() -> Vec<Vec<u8>> {
        vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
    }

    fn work(pieces: &[Vec<u8>]) -> Vec<PieceWork> {
        let hashes: Vec<PieceHash> = pieces
            .iter()
            .map(|piece| {
                let mut hash = [0; 20];
                hash.copy_from_slice(&sha1::Sha1::digest(piece));
                hash
            })
            .collect();
        build_work(&hashes, 4, 10)
    }

    /// Runs a single worker against `peer` and collects its events.
    fn run_worker(peer: Peer, queue: &WorkQueue) -> (Vec<Event>, Completion) {
        let config = test_config();
        let completion = Completion::new(3);
        let cancel = AtomicBool::new(false);
        let swarm = Swarm {
            info_hash: INFO_HASH,
            peer_id: [0x22; 20],
            config: &config,
            queue,
            completion: &completion,
            cancel: &cancel,
        };
        let (tx, rx) = unbounded();
        Worker::new(peer, &swarm, tx).start_download();
        (rx.try_iter().collect(), completion)
    }

    #[test]
    fn honest_peer_delivers_every_piece() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces.clone()).spawn(0);

        let (events, completion) = run_worker(peer, &queue);

        assert!(matches!(events[0], Event::Connected(0)));
        let mut results: Vec<PieceResult> = events
            .into_iter()
            .filter_map(|event| match event {
                Event::Piece(result) => Some(result),
                _ => None,
            })
            .collect();
        results.sort_by_key(|result| result.index);
        assert_eq!(results.len(), 3);
        for result in results {
            assert_eq!(result.data, pieces[result.index as usize]);
        }
        assert!(completion.is_complete());
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.checked_out(), 0);
    }

    #[test]
    fn stalled_peer_hands_its_piece_back() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces)
            .behaving(Behavior::Stall)
            .spawn(0);

        let (events, completion) = run_worker(peer, &queue);

        assert_eq!(events.len(), 1);
        assert_eq!(completion.completed(), 0);
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.checked_out(), 0);
    }

    #[test]
    fn keep_alives_do_not_hold_a_piece_forever() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces)
            .behaving(Behavior::KeepAlive)
            .spawn(0);

        let start = Instant::now();
        let (events, completion) = run_worker(peer, &queue);

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(events.len(), 1);
        assert_eq!(completion.completed(), 0);
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.checked_out(), 0);
    }

    #[test]
    fn corrupt_piece_is_requeued() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces)
            .behaving(Behavior::Corrupt)
            .spawn(0);

        let (events, completion) = run_worker(peer, &queue);

        assert!(events.iter().all(|e| matches!(e, Event::Connected(_))));
        assert!(!completion.is_claimed(0));
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn peer_lacking_pieces_gives_up_after_max_skips() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces.clone())
            .advertising(vec![1])
            .spawn(0);

        let (events, completion) = run_worker(peer, &queue);

        // piece 1 is served, pieces 0 and 2 are skipped until the cap
        let delivered: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                Event::Piece(result) => Some(result.index),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1]);
        assert!(completion.is_claimed(1));
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.checked_out(), 0);
    }

    #[test]
    fn choking_peer_is_abandoned() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let peer = Seeder::new(INFO_HASH, pieces)
            .behaving(Behavior::NeverUnchoke)
            .spawn(0);

        let (events, _) = run_worker(peer, &queue);
        assert_eq!(events.len(), 1);
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.checked_out(), 0);
    }

    #[test]
    fn unreachable_peer_sends_nothing() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let (events, _) = run_worker(closed_port(), &queue);
        assert!(events.is_empty());
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn duplicate_verified_piece_is_discarded() {
        let pieces = pieces();
        let queue = WorkQueue::new(work(&pieces));
        let config = test_config();
        let completion = Completion::new(3);
        // another worker already delivered piece 0
        assert!(completion.claim(0));
        let cancel = AtomicBool::new(false);
        let swarm = Swarm {
            info_hash: INFO_HASH,
            peer_id: [0x22; 20],
            config: &config,
            queue: &queue,
            completion: &completion,
            cancel: &cancel,
        };
        let (tx, rx) = unbounded();
        let peer = Seeder::new(INFO_HASH, pieces).spawn(0);
        Worker::new(peer, &swarm, tx).start_download();

        let delivered: Vec<u32> = rx
            .try_iter()
            .filter_map(|event| match event {
                Event::Piece(result) => Some(result.index),
                _ => None,
            })
            .collect();
        assert!(!delivered.contains(&0));
        assert_eq!(delivered.len(), 2);
        assert_eq!(completion.completed(), 3);
    }
}
