//! Engine configuration.
//!
//! Operator-facing knobs for the peer engine. The exact file format and CLI
//! surface live outside this crate; consumers deserialize into [`Config`]
//! and hand it to the torrent coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default chunk (block) size requested from peers.
pub const DEFAULT_CHUNK_SIZE: u32 = 16384;

/// Stop refilling the request queue above this many in-flight chunks.
pub const DEFAULT_HIGH_WATERMARK: usize = 30;

/// Refill the request queue once in-flight chunks drop to this level.
pub const DEFAULT_LOW_WATERMARK: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("max open files must be non-zero")]
    ZeroOpenFiles,

    #[error("watermarks invalid: low {low} must be below high {high}")]
    InvertedWatermarks { low: usize, high: usize },
}

/// Configuration for a torrent's peer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory downloads are placed under.
    pub download_dir: PathBuf,

    /// TCP port the listener announces.
    pub listen_port: u16,

    /// Maximum number of file handles kept open at steady state.
    pub max_open_files: usize,

    /// Size of chunk requests sent to peers.
    pub chunk_size: u32,

    /// Refill the per-peer request queue when it drains to this size.
    pub low_watermark: usize,

    /// Fill the per-peer request queue up to this size.
    pub high_watermark: usize,

    /// How long a peer may take to complete the handshake.
    pub handshake_timeout: Duration,

    /// Keep-alive send interval; peers idle for the same span are dropped.
    pub keep_alive_interval: Duration,

    /// Maximum simultaneous peer sessions per torrent.
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            max_open_files: 128,
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            handshake_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(120),
            max_peers: 50,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.max_open_files == 0 {
            return Err(ConfigError::ZeroOpenFiles);
        }
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::InvertedWatermarks {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        Ok(())
    }
}
