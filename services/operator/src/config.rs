use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tessera_reconcile::Backoff;

use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub placement_url: String,
    pub state_dir: PathBuf,
    pub reconcile_interval: Duration,
    pub query_timeout: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let placement_url = lookup("TESSERA_PLACEMENT_URL")
            .unwrap_or_else(|| "http://127.0.0.1:2379".to_string());

        let state_dir = lookup("TESSERA_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/tessera"));

        let reconcile_interval =
            Duration::from_secs(parse_or(&lookup, "TESSERA_RECONCILE_INTERVAL_SECS", 30)?);
        let query_timeout = Duration::from_secs(parse_or(&lookup, "TESSERA_QUERY_TIMEOUT_SECS", 5)?);
        let max_retries = parse_or(&lookup, "TESSERA_MAX_RETRIES", 3)?;
        let retry_window =
            Duration::from_secs(parse_or(&lookup, "TESSERA_RETRY_WINDOW_SECS", 600)?);

        let log_level = lookup("TESSERA_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            placement_url,
            state_dir,
            reconcile_interval,
            query_timeout,
            max_retries,
            retry_window,
            log_level,
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            interval: self.reconcile_interval,
            max_retries: self.max_retries,
            retry_window: self.retry_window,
            backoff: Backoff::default(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {value:?}")),
        None => Ok(default),
    }
}
