//! Command-line arguments for the `zmesh` simulation binary.
//!
//! Protocol tunables live in a TOML file handled by `core::config`; the
//! flags here select that file, the verbosity, and the shape of the
//! simulated mesh the binary drives transfers across.

use std::path::PathBuf;

use clap::Parser;

use crate::core::config::{Config, ConfigError};
use crate::core::port::LinkProfile;

/// Z-Mesh: file transfer over Meshtastic-style LoRa mesh radios.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to a TOML protocol config.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory where the receiving node saves files.
    #[clap(long)]
    pub download_dir: Option<PathBuf>,

    /// File to push through the simulated mesh.
    #[clap(long)]
    pub file: Option<PathBuf>,

    /// Bytes of random payload when --file is not given.
    #[clap(long, default_value_t = 2048)]
    pub bytes: usize,

    /// Per-frame loss probability of the simulated mesh (0.0 - 1.0).
    #[clap(long, default_value_t = 0.0)]
    pub loss: f64,

    /// Per-frame duplication probability (0.0 - 1.0).
    #[clap(long, default_value_t = 0.0)]
    pub duplicate: f64,

    /// Base one-way latency of the simulated mesh, milliseconds.
    #[clap(long, default_value_t = 40)]
    pub latency_ms: u64,

    /// Extra random latency per frame, milliseconds. Produces reordering.
    #[clap(long, default_value_t = 80)]
    pub jitter_ms: u64,

    /// RNG seed; the same seed replays the same loss pattern.
    #[clap(long, default_value_t = 1)]
    pub seed: u64,
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }

    /// Protocol config: the TOML file if given, defaults otherwise, with
    /// the CLI download directory applied on top.
    pub fn protocol_config(&self) -> Result<Config, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if self.download_dir.is_some() {
            cfg.download_dir = self.download_dir.clone();
        }
        Ok(cfg)
    }

    pub fn link_profile(&self) -> LinkProfile {
        LinkProfile {
            loss: self.loss,
            duplicate: self.duplicate,
            delay_ms: self.latency_ms,
            jitter_ms: self.jitter_ms,
        }
    }
}
