//! # Swarm BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent v1 peer wire protocol
//! - Multitracker support with parallel announces
//! - One worker thread per peer, pipelined block requests
//! - Piece verification with SHA-1 hashing, failed pieces retried elsewhere
//! - Progress tracking with visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! swarm <torrent_file>
//! swarm <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: Parses arguments, loads torrent, assembles the file
//! - **Worker threads**: Each handles communication with one peer
//! - **Work queue**: Pieces are checked out by workers and handed back on failure
//! - **Channel**: Verified pieces flow back to the main thread

#[macro_use]
extern crate log;

mod args;
mod bitfield;
mod client;
mod config;
mod download;
mod error;
mod handshake;
mod message;
#[cfg(test)]
mod mock;
mod peer;
mod piece;
mod queue;
mod torrent;
mod tracker;
mod worker;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use torrent::*;

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() || safe_name == "." || safe_name == ".." {
        "download".to_string()
    } else {
        safe_name
    }
}

/// Ask before replacing an existing file.
fn confirm_overwrite(path: &Path, input: &mut impl BufRead) -> Result<bool> {
    print!(
        "Output file '{}' already exists. Overwrite it? (y/N): ",
        path.display()
    );
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();

    Ok(answer == "y" || answer == "yes")
}

/// Write the downloaded content, nothing is written on failure upstream.
fn save(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("could not write '{}'", path.display()))
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} {pos}/{len} pieces [{bar:40.cyan/blue}] {percent}% ({eta})")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => debug!("Invalid progress bar template: {}", e),
    }
    pb
}

fn run(args: Args) -> Result<()> {
    let config = args.config();

    let torrent = Torrent::open(&args.torrent)?;
    let output_filepath = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(sanitize_filename(torrent.name())));

    // Ask before downloading, the user may not want to replace the file
    if output_filepath.exists()
        && !args.force
        && !confirm_overwrite(&output_filepath, &mut io::stdin().lock())?
    {
        println!("Download cancelled.");
        return Ok(());
    }

    let peer_id = generate_peer_id();
    let peers = torrent
        .request_peers(&peer_id, config.port)
        .context("could not discover peers")?;

    println!(
        "Downloading {:?} ({} bytes, {} pieces) from {} peers",
        torrent.name(),
        torrent.length(),
        torrent.nb_pieces(),
        peers.len()
    );

    let pb = progress_bar();
    let result = torrent.download(peers, peer_id, &config, &pb);
    pb.finish_and_clear();
    let data = result?;

    save(&output_filepath, &data)?;
    println!("Saved in \"{}\".", output_filepath.display());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
