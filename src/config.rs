//! # Download Tuning
//!
//! Timeouts and pipelining limits used by the swarm engine. Defaults follow
//! common client practice; every field can be overridden from the command
//! line (see `args.rs`).

use std::time::Duration;

/// Standard block size for piece downloads (16 KiB)
pub const BLOCK_SIZE_MAX: u32 = 16384;

// Maximum number of concurrent block requests per peer
const NB_REQUESTS_MAX: u32 = 5;

// Consecutive pieces a peer may lack before its worker gives up
const NB_SKIPS_MAX: u32 = 5;

// Default port for BitTorrent client connections
const PORT: u16 = 6881;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bound on TCP connect and on the handshake exchange
    pub connect_timeout: Duration,
    /// Bound on every read and write once the handshake is done
    pub message_timeout: Duration,
    /// How long a peer may keep us choked before we abandon it
    pub unchoke_timeout: Duration,
    /// Size of the sub-ranges requested from peers
    pub block_size: u32,
    /// Outstanding requests per peer
    pub pipeline_depth: u32,
    /// Consecutive unavailable pieces tolerated per peer
    pub max_skips: u32,
    /// Port announced to the tracker
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout: Duration::from_secs(15),
            message_timeout: Duration::from_secs(30),
            unchoke_timeout: Duration::from_secs(30),
            block_size: BLOCK_SIZE_MAX,
            pipeline_depth: NB_REQUESTS_MAX,
            max_skips: NB_SKIPS_MAX,
            port: PORT,
        }
    }
}
