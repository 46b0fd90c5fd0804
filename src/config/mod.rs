//! Configuration module for guardrail.
//!
//! Loads configuration from environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GuardError, GuardResult};

/// Where the rate limiter keeps its snapshots.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    #[default]
    Memory,
    File,
    Mongo,
}

impl FromStr for SnapshotBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            other => Err(format!("unknown backend '{other}', expected memory, file or mongo")),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // Cache
    pub cache_default_ttl: Duration,
    pub cache_max_size: usize,
    pub cache_sweep_interval: Duration,
    pub cache_prefetch_interval: Duration,

    // Rate limiter
    pub history_capacity: usize,
    pub snapshot_backend: SnapshotBackend,
    /// Directory used by the file backend.
    pub snapshot_dir: PathBuf,

    // MongoDB, only required by the mongo backend
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,

    // HTTP
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if a variable is set but cannot be parsed, or
    /// if the mongo backend is selected without `MONGODB_URI`.
    pub fn from_env() -> GuardResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GuardResult<Self> {
        let snapshot_backend = parse_or(&lookup, "SNAPSHOT_BACKEND", SnapshotBackend::Memory)?;

        let mongodb_uri = lookup("MONGODB_URI").filter(|s| !s.trim().is_empty());
        if snapshot_backend == SnapshotBackend::Mongo && mongodb_uri.is_none() {
            return Err(GuardError::InvalidConfig {
                var: "MONGODB_URI",
                value: String::new(),
                reason: "must be set when SNAPSHOT_BACKEND is mongo".to_string(),
            });
        }

        Ok(Self {
            cache_default_ttl: Duration::from_secs(parse_or(&lookup, "CACHE_DEFAULT_TTL_SECS", 300)?),
            cache_max_size: parse_or(&lookup, "CACHE_MAX_SIZE", 1000)?,
            cache_sweep_interval: positive_secs(&lookup, "CACHE_SWEEP_INTERVAL_SECS", 60)?,
            cache_prefetch_interval: positive_secs(&lookup, "CACHE_PREFETCH_INTERVAL_SECS", 30)?,
            history_capacity: parse_or(&lookup, "HISTORY_CAPACITY", 1000)?,
            snapshot_backend,
            snapshot_dir: lookup("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/snapshots")),
            mongodb_uri,
            mongodb_database: lookup("MONGODB_DATABASE").unwrap_or_else(|| "guardrail".to_string()),
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
        })
    }
}

/// Parse `var` if set, otherwise use `default`.
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> GuardResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| GuardError::InvalidConfig {
            var,
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a period in seconds that must be non-zero.
fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> GuardResult<Duration> {
    match parse_or(lookup, var, default)? {
        0 => Err(GuardError::InvalidConfig {
            var,
            value: "0".to_string(),
            reason: "interval must be at least one second".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}
