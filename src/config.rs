// src/config.rs

use crate::memory::MIB;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Chunks are never larger than this, whatever `chunk_size_bytes` says.
pub const MAX_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a global rate limit is divided between concurrent downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RateSplit {
    /// Divide by the concurrency chosen at startup.
    #[default]
    Fixed,
    /// Re-read memory headroom every round and divide by that round's concurrency.
    PerRound,
}

/// Immutable run configuration.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficConfig {
    pub max_memory_bytes: u64,
    pub chunk_size_bytes: usize,
    pub base_max_concurrency: usize,
    pub concurrency_hard_cap: usize,
    pub round_interval: Duration,
    /// `None` runs until stopped.
    pub repeat_count: Option<u64>,
    /// Bytes per second, 0 = unlimited.
    pub global_rate_limit: u64,
    /// Bytes per second, 0 = unlimited.
    pub per_download_rate_limit: u64,
    pub request_timeout: Duration,
    pub memory_wait_timeout: Duration,
    pub rate_split: RateSplit,
}

impl TrafficConfig {
    /// Size of the accounting/pacing unit actually used.
    pub fn chunk_len(&self) -> usize {
        self.chunk_size_bytes.clamp(1, MAX_CHUNK_BYTES)
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 100 * MIB,
            chunk_size_bytes: 8192,
            base_max_concurrency: 5,
            concurrency_hard_cap: 20,
            round_interval: Duration::from_secs(1),
            repeat_count: None,
            global_rate_limit: 0,
            per_download_rate_limit: 0,
            request_timeout: Duration::from_secs(30),
            memory_wait_timeout: Duration::from_secs(30),
            rate_split: RateSplit::Fixed,
        }
    }
}

/// Command-line flags, each also readable from the environment.
#[derive(Debug, Parser)]
#[command(name = "trafficflow")]
#[command(about = "Continuously downloads and discards a set of URLs to generate network traffic", long_about = None)]
pub struct Settings {
    /// Memory ceiling for the process in MB.
    #[arg(long, env = "MAX_MEMORY_MB", default_value_t = 100)]
    pub max_memory_mb: u64,

    /// Read chunk size in bytes (capped at 4096).
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 8192)]
    pub chunk_size: usize,

    /// Seconds to wait between rounds.
    #[arg(long, env = "DOWNLOAD_INTERVAL", default_value_t = 1)]
    pub interval: u64,

    /// Preferred number of concurrent downloads.
    #[arg(long, env = "MAX_WORKERS", default_value_t = 5)]
    pub max_workers: usize,

    /// Number of rounds; empty or absent runs until stopped.
    #[arg(long, env = "REPEAT_COUNT")]
    pub repeat_count: Option<String>,

    /// Global rate limit in KB/s (0 = unlimited).
    #[arg(long, env = "MAX_SPEED_KBPS", default_value_t = 0)]
    pub max_speed_kbps: u64,

    /// Per-download rate limit in KB/s (0 = unlimited).
    #[arg(long, env = "PER_DOWNLOAD_SPEED_KBPS", default_value_t = 0)]
    pub per_download_speed_kbps: u64,

    /// File with one URL per line.
    #[arg(long, env = "URLS_FILE", default_value = "urls.txt")]
    pub urls_file: PathBuf,

    /// Per-request timeout in seconds.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// How long a round waits for memory to drop before it is skipped.
    #[arg(long, env = "MEMORY_WAIT_SECS", default_value_t = 30)]
    pub memory_wait_secs: u64,

    /// Upper bound on concurrency regardless of free memory.
    #[arg(long, env = "CONCURRENCY_HARD_CAP", default_value_t = 20)]
    pub concurrency_hard_cap: usize,

    /// How a global rate limit is split between downloads.
    #[arg(long, env = "RATE_SPLIT", value_enum, default_value_t = RateSplit::Fixed)]
    pub rate_split: RateSplit,

    /// Print the final statistics as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Settings {
    /// Validates the flags into a `TrafficConfig`.
    pub fn to_config(&self) -> Result<TrafficConfig, ConfigError> {
        if self.max_memory_mb == 0 {
            return Err(ConfigError::Invalid("memory ceiling must be at least 1 MB".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be positive".into()));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("worker count must be positive".into()));
        }
        if self.concurrency_hard_cap == 0 {
            return Err(ConfigError::Invalid("concurrency cap must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }

        Ok(TrafficConfig {
            max_memory_bytes: self.max_memory_mb.saturating_mul(MIB),
            chunk_size_bytes: self.chunk_size,
            base_max_concurrency: self.max_workers,
            concurrency_hard_cap: self.concurrency_hard_cap,
            round_interval: Duration::from_secs(self.interval),
            repeat_count: parse_repeat_count(self.repeat_count.as_deref())?,
            global_rate_limit: self.max_speed_kbps.saturating_mul(1024),
            per_download_rate_limit: self.per_download_speed_kbps.saturating_mul(1024),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            memory_wait_timeout: Duration::from_secs(self.memory_wait_secs),
            rate_split: self.rate_split,
        })
    }
}

fn parse_repeat_count(raw: Option<&str>) -> Result<Option<u64>, ConfigError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("REPEAT_COUNT must be a number, got {:?}", value))),
    }
}
