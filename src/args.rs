//! # Command-Line Argument Parsing
//!
//! This module handles parsing and validation of command-line arguments.
//!
//! ## Arguments
//!
//! - `<torrent>`: Path to the .torrent file (required)
//! - `-o, --output <output>`: Output filename (defaults to name from torrent)
//! - `-f, --force`: Overwrite the output file without asking
//! - tuning flags mapped onto [`Config`]
//!
//! ## Example
//!
//! ```bash
//! swarm debian.iso.torrent
//! swarm debian.iso.torrent -o debian.iso --pipeline 10
//! ```

use crate::config::Config;

use clap::Parser;

use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client downloading from a swarm of peers."
)]
pub struct Args {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Overwrite the output file without asking
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Seconds allowed to connect to a peer and complete the handshake
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    pub connect_timeout: u64,

    /// Seconds a peer may stay silent before it is dropped
    #[arg(long = "timeout", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub message_timeout: u64,

    /// Outstanding block requests per peer
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub pipeline: u32,

    /// Consecutive pieces a peer may lack before it is dropped
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_skips: u32,

    /// Port announced to the trackers
    #[arg(long, default_value_t = 6881)]
    pub port: u16,
}

impl Args {
    /// Build the download configuration from the tuning flags.
    pub fn config(&self) -> Config {
        let message_timeout = Duration::from_secs(self.message_timeout);
        Config {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            message_timeout,
            unchoke_timeout: message_timeout,
            pipeline_depth: self.pipeline,
            max_skips: self.max_skips,
            port: self.port,
            ..Config::default()
        }
    }
}
