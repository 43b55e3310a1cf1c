use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

const DEFAULT_INTERVAL_SECS: u64 = 3600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONCURRENCY: usize = 4;

/// Daemon configuration, read from the environment. `.env` files are
/// loaded by `main` before this runs.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub source_url: String,
    pub source_token: String,
    pub target_url: String,
    pub target_token: String,
    pub documents_db: String,
    pub tags_db: String,
    pub correspondents_db: String,
    pub interval: Duration,
    pub http_timeout: Duration,
    pub concurrency: usize,
    pub state_db: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let interval_secs = parse_u64(&get, "SHELFSYNC_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?;
        if interval_secs == 0 {
            bail!("SHELFSYNC_INTERVAL_SECS must be greater than zero");
        }
        let timeout_secs = parse_u64(&get, "SHELFSYNC_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let concurrency = parse_u64(&get, "SHELFSYNC_CONCURRENCY", DEFAULT_CONCURRENCY as u64)?
            .max(1) as usize;

        Ok(Self {
            source_url: required(&get, "SHELFSYNC_SOURCE_URL")?,
            source_token: required(&get, "SHELFSYNC_SOURCE_TOKEN")?,
            target_url: required(&get, "SHELFSYNC_TARGET_URL")?,
            target_token: required(&get, "SHELFSYNC_TARGET_TOKEN")?,
            documents_db: required(&get, "SHELFSYNC_DOCUMENTS_DB")?,
            tags_db: required(&get, "SHELFSYNC_TAGS_DB")?,
            correspondents_db: required(&get, "SHELFSYNC_CORRESPONDENTS_DB")?,
            interval: Duration::from_secs(interval_secs),
            http_timeout: Duration::from_secs(timeout_secs),
            concurrency,
            state_db: get("SHELFSYNC_STATE_DB")
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    get(key)
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("{key} is not set"))
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match get(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} is not a valid number: {value}")),
        _ => Ok(default),
    }
}
