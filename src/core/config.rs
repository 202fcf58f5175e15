//! Protocol configuration: every tunable in one place.
//!
//! Values can come from a TOML file (`Config::from_file`), with CLI
//! overrides applied on top by the binary. Defaults match the timing the
//! protocol was tuned for on real LoRa meshes: long timeouts, few
//! retries, one frame per second.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::codec::FRAME_BUDGET;

/// Bounds accepted for `chunk_payload_max`.
pub const CHUNK_PAYLOAD_RANGE: (usize, usize) = (16, 200);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_payload_max {0} outside {}..={}", CHUNK_PAYLOAD_RANGE.0, CHUNK_PAYLOAD_RANGE.1)]
    ChunkPayloadRange(usize),
    #[error("chunk_payload_max {0} cannot fit the {FRAME_BUDGET}-byte frame budget once base64-encoded")]
    ChunkPayloadBudget(usize),
    #[error("max_retries must be at least 1")]
    NoRetries,
    #[error("tx_rate_hz must be positive")]
    BadTxRate,
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// All recognized protocol options. Unknown TOML keys are rejected so a
/// typo cannot silently fall back to a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bytes of file data per DATA frame, pre-encoding. 16..=200.
    pub chunk_payload_max: usize,
    /// Watchdog deadline for an outstanding DATA chunk, seconds.
    pub chunk_timeout: u64,
    /// Retransmissions allowed per chunk (and per BEGIN) before failing.
    pub max_retries: u8,
    /// How long BEGIN may go unanswered before being retried, seconds.
    pub negotiate_timeout: u64,
    /// How long to await FIN after END, seconds. One END retry allowed.
    pub final_timeout: u64,
    /// Receiver-side inactivity window before aborting, seconds.
    pub recv_idle_timeout: u64,
    /// Interval between discovery PING broadcasts, seconds.
    pub discovery_interval: u64,
    /// A node heard within this window counts as active, seconds.
    pub node_active_window: u64,
    /// Token bucket capacity for outbound DATA frames.
    pub tx_burst: u32,
    /// Token bucket refill rate, tokens per second.
    pub tx_rate_hz: f64,
    /// Cap on NAKs sent per END while chunks are still missing.
    pub nak_batch_max: usize,
    /// SNR change (dB) that re-announces an already-known node.
    pub snr_event_threshold: f64,
    /// Directory for received files. `None` means the platform Downloads
    /// folder.
    pub download_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_payload_max: 120,
            chunk_timeout: 30,
            max_retries: 5,
            negotiate_timeout: 30,
            final_timeout: 60,
            recv_idle_timeout: 120,
            discovery_interval: 60,
            node_active_window: 600,
            tx_burst: 3,
            tx_rate_hz: 1.0,
            nak_batch_max: 8,
            snr_event_threshold: 3.0,
            download_dir: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, then validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the protocol cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (lo, hi) = CHUNK_PAYLOAD_RANGE;
        if !(lo..=hi).contains(&self.chunk_payload_max) {
            return Err(ConfigError::ChunkPayloadRange(self.chunk_payload_max));
        }
        // Worst-case DATA frame: header fields plus padded base64 payload.
        let b64 = self.chunk_payload_max.div_ceil(3) * 4;
        let header = "D|0123456789abcdef|65535|".len();
        if header + b64 > FRAME_BUDGET {
            return Err(ConfigError::ChunkPayloadBudget(self.chunk_payload_max));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoRetries);
        }
        if self.tx_rate_hz <= 0.0 {
            return Err(ConfigError::BadTxRate);
        }
        Ok(())
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout)
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiate_timeout)
    }

    pub fn final_timeout(&self) -> Duration {
        Duration::from_secs(self.final_timeout)
    }

    pub fn recv_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_idle_timeout)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval)
    }

    pub fn node_active_window(&self) -> Duration {
        Duration::from_secs(self.node_active_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_payload_range_enforced() {
        let mut cfg = Config::default();
        cfg.chunk_payload_max = 8;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ChunkPayloadRange(8))
        ));
        cfg.chunk_payload_max = 201;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_large_payload_must_fit_budget() {
        let mut cfg = Config::default();
        // 200 raw bytes -> 268 base64 chars, over the 230-byte frame budget.
        cfg.chunk_payload_max = 200;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ChunkPayloadBudget(200))
        ));
        // 150 raw bytes -> 200 base64 chars, fits with header room to spare.
        cfg.chunk_payload_max = 150;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_toml_parse_and_unknown_key_rejection() {
        let cfg: Config = toml::from_str("chunk_timeout = 10\ntx_burst = 5").unwrap();
        assert_eq!(cfg.chunk_timeout, 10);
        assert_eq!(cfg.tx_burst, 5);
        assert_eq!(cfg.max_retries, 5);

        let bad = toml::from_str::<Config>("chunk_timout = 10");
        assert!(bad.is_err());
    }
}
