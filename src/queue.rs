//! # Piece Work Queue
//!
//! Backlog of pieces not downloaded yet, shared by every worker.
//!
//! A popped piece is *checked out*: it belongs to one worker until the
//! worker either pushes it back (failure, or the peer lacks it) or finishes
//! it. The queue is drained only when nothing is pending *and* nothing is
//! checked out, so a worker never leaves while a sibling may still hand a
//! piece back.

use crate::piece::PieceWork;

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

// Upper bound on a single wait, so closing is noticed even without a wakeup
const WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<PieceWork>,
    checked_out: usize,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new(pieces: Vec<PieceWork>) -> WorkQueue {
        WorkQueue {
            state: Mutex::new(State {
                pending: pieces.into(),
                checked_out: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a worker panicking while holding the lock leaves a consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks out the next pending piece.
    ///
    /// Blocks while the queue is empty but pieces are still checked out.
    /// Returns `None` once the queue is drained or closed.
    pub fn pop(&self) -> Option<PieceWork> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(piece_work) = state.pending.pop_front() {
                state.checked_out += 1;
                return Some(piece_work);
            }
            if state.checked_out == 0 {
                return None;
            }
            state = match self.available.wait_timeout(state, WAIT_SLICE) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Hands a checked out piece back, behind every pending one.
    pub fn push(&self, piece_work: PieceWork) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.pending.push_back(piece_work);
        drop(state);
        self.available.notify_one();
    }

    /// Marks a checked out piece as done.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        let drained = state.checked_out == 0 && state.pending.is_empty();
        drop(state);
        if drained {
            self.available.notify_all();
        }
    }

    /// Stops handing out work. Waiting and future pops return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    #[cfg(test)]
    pub fn checked_out(&self) -> usize {
        self.lock().checked_out
    }
}
