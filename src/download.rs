//! # Swarm Download Orchestration
//!
//! Drives one download from a list of peers to the assembled file content.
//!
//! 1. **Seed the work queue** with one piece per hash
//! 2. **Spawn one worker thread per peer** inside a thread scope
//! 3. **Collect verified pieces** from the event channel into the output buffer
//! 4. **Stop** once every piece is written, or once every worker is gone
//!
//! The output buffer is owned by the orchestrating thread. Workers hand over
//! verified pieces through the channel, and a piece reaches the channel only
//! after winning its [`Completion`] claim, so each byte range is written once.

use crate::config::Config;
use crate::error::DownloadError;
use crate::peer::Peer;
use crate::piece::*;
use crate::queue::WorkQueue;
use crate::worker::*;

use crossbeam_channel::unbounded;
use indicatif::ProgressBar;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Output buffer of a download, each piece range is written once.
#[derive(Debug)]
struct Output {
    data: Vec<u8>,
    written: Vec<bool>,
    nb_written: usize,
    piece_length: u32,
}

impl Output {
    fn new(length: usize, nb_pieces: usize, piece_length: u32) -> Output {
        Output {
            data: vec![0; length],
            written: vec![false; nb_pieces],
            nb_written: 0,
            piece_length,
        }
    }

    /// Copies a verified piece at its offset. Returns `false`, leaving the
    /// buffer untouched, if the index was already written or does not fit.
    fn write(&mut self, piece_result: &PieceResult) -> bool {
        let index = piece_result.index as usize;
        if self.written.get(index) != Some(&false) {
            return false;
        }

        let begin = get_piece_offset(piece_result.index, self.piece_length) as usize;
        let end = begin + piece_result.data.len();
        if end > self.data.len() {
            return false;
        }

        self.data[begin..end].copy_from_slice(&piece_result.data);
        self.written[index] = true;
        self.nb_written += 1;
        true
    }

    fn missing(&self) -> usize {
        self.written.len() - self.nb_written
    }

    fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

/// Everything needed to download one file from a swarm.
#[derive(Debug, Clone)]
pub struct Download {
    /// Candidate peers returned by the tracker
    pub peers: Vec<Peer>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte identifier of this client
    pub peer_id: [u8; 20],
    /// Expected digest of every piece, in index order
    pub pieces_hashes: Vec<PieceHash>,
    /// Nominal piece size in bytes
    pub piece_length: u32,
    /// Total file size in bytes
    pub length: u64,
}

impl Download {
    pub fn new(
        peers: Vec<Peer>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        pieces_hashes: Vec<PieceHash>,
        piece_length: u32,
        length: u64,
    ) -> Download {
        Download {
            peers,
            info_hash,
            peer_id,
            pieces_hashes,
            piece_length,
            length,
        }
    }

    fn check_preconditions(&self, config: &Config) -> Result<(), DownloadError> {
        if self.peers.is_empty() {
            return Err(DownloadError::PreconditionFailed("no peers to download from".into()));
        }
        if self.piece_length == 0 {
            return Err(DownloadError::PreconditionFailed("piece length is zero".into()));
        }
        if config.block_size == 0 || config.pipeline_depth == 0 {
            return Err(DownloadError::PreconditionFailed(
                "block size and pipeline depth must be positive".into(),
            ));
        }

        let expected = self.length.div_ceil(self.piece_length as u64);
        if expected != self.pieces_hashes.len() as u64 {
            return Err(DownloadError::PreconditionFailed(format!(
                "{} bytes in pieces of {} need {} hashes, got {}",
                self.length,
                self.piece_length,
                expected,
                self.pieces_hashes.len()
            )));
        }
        usize::try_from(self.length).map_err(|_| {
            DownloadError::PreconditionFailed("file does not fit in memory".into())
        })?;

        Ok(())
    }

    /// Downloads every piece and returns the assembled file content.
    ///
    /// `progress` is advanced by one for each verified piece.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::PreconditionFailed`] if the download cannot start,
    ///   or if no peer could be connected to
    /// - [`DownloadError::Incomplete`] if every worker stopped while pieces
    ///   were still missing
    pub fn run(&self, config: &Config, progress: &ProgressBar) -> Result<Vec<u8>, DownloadError> {
        self.check_preconditions(config)?;

        let nb_pieces = self.pieces_hashes.len();
        info!(
            "Downloading {} pieces from {} peers",
            nb_pieces,
            self.peers.len()
        );
        progress.set_length(nb_pieces as u64);

        let queue = WorkQueue::new(build_work(
            &self.pieces_hashes,
            self.piece_length,
            self.length,
        ));
        let completion = Completion::new(nb_pieces);
        let cancel = AtomicBool::new(false);
        let swarm = Swarm {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            config,
            queue: &queue,
            completion: &completion,
            cancel: &cancel,
        };

        let mut output = Output::new(self.length as usize, nb_pieces, self.piece_length);
        let mut connected = HashSet::new();

        thread::scope(|scope| {
            let (events_tx, events_rx) = unbounded();

            for peer in &self.peers {
                let worker = Worker::new(peer.clone(), &swarm, events_tx.clone());
                let spawned = thread::Builder::new()
                    .name(format!("peer-{}", peer.id))
                    .spawn_scoped(scope, move || worker.start_download());
                if let Err(e) = spawned {
                    warn!("Could not start worker for peer {}: {}", peer, e);
                }
            }
            // only workers hold senders now, the channel closes when the last one exits
            drop(events_tx);

            while !output.is_complete() {
                let event = match events_rx.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                };

                match event {
                    Event::Connected(id) => {
                        connected.insert(id);
                    }
                    Event::Piece(piece_result) => {
                        if output.write(&piece_result) {
                            progress.inc(1);
                        } else {
                            debug!("Ignoring duplicate piece {}", piece_result.index);
                        }
                    }
                }
            }

            // Stop remaining workers at their next suspension point
            cancel.store(true, Ordering::Release);
            queue.close();
        });

        debug!(
            "{} of {} pieces claimed by workers",
            completion.completed(),
            completion.total()
        );
        if output.is_complete() {
            info!("Downloaded {} pieces", nb_pieces);
            return Ok(output.data);
        }

        if connected.is_empty() {
            return Err(DownloadError::PreconditionFailed(
                "could not connect to any peer".into(),
            ));
        }
        Err(DownloadError::Incomplete {
            missing: output.missing(),
            total: nb_pieces,
        })
    }
}
