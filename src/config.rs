//! Process configuration.
//!
//! Everything is optional with defaults; genuinely invalid values (bad port
//! range, empty backoff schedule) are configuration errors and fail fast.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Defaults documented in the public interface contract.
const DEFAULT_PORT_RANGE: (u16, u16) = (8000, 8010);
const DEFAULT_INGEST_INTERVAL_S: u64 = 60;
const DEFAULT_REQUEST_MIN_SPACING_S: u64 = 3;
const DEFAULT_BACKOFF_SCHEDULE_S: [u64; 3] = [10, 20, 40];
const DEFAULT_CACHE_TTL_S: u64 = 300;
const DEFAULT_STALE_THRESHOLD_S: u64 = 900;
const DEFAULT_LLM_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_LLM_MODEL_PREFERENCE: &str = "llama3:8b,llama3,mistral";
const DEFAULT_DB_FILE: &str = "propboard.db";
const DEFAULT_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Clone)]
pub struct Config {
    /// Inclusive TCP port range the supervisor scans for a free listener.
    pub port_range: (u16, u16),
    pub ingest_interval: Duration,
    pub request_min_spacing: Duration,
    pub backoff_schedule: Vec<Duration>,
    pub cache_ttl: Duration,
    /// Age of `oldest_fetched_at` beyond which the board reports "stale".
    pub stale_threshold: Duration,
    pub llm_url: String,
    pub llm_model_preference: Vec<String>,
    pub db_path: String,
    /// Projections whose game started more than this many days ago are
    /// archived by the retention sweep.
    pub retention_days: i64,
    pub alert_slack_webhook: Option<String>,
    pub alert_email: Option<String>,
    pub sentry_dsn: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port_range = match env::var("A1_PORT_RANGE") {
            Ok(raw) => parse_port_range(&raw)?,
            Err(_) => DEFAULT_PORT_RANGE,
        };

        let backoff_schedule = match env::var("A1_BACKOFF_SCHEDULE_S") {
            Ok(raw) => parse_backoff_schedule(&raw)?,
            Err(_) => DEFAULT_BACKOFF_SCHEDULE_S
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
        };

        let llm_model_preference = env::var("A1_LLM_MODEL_PREFERENCE")
            .unwrap_or_else(|_| DEFAULT_LLM_MODEL_PREFERENCE.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if llm_model_preference.is_empty() {
            bail!("A1_LLM_MODEL_PREFERENCE must name at least one model");
        }

        Ok(Self {
            port_range,
            ingest_interval: Duration::from_secs(env_u64(
                "A1_INGEST_INTERVAL_S",
                DEFAULT_INGEST_INTERVAL_S,
            )?),
            request_min_spacing: Duration::from_secs(env_u64(
                "A1_REQUEST_MIN_SPACING_S",
                DEFAULT_REQUEST_MIN_SPACING_S,
            )?),
            backoff_schedule,
            cache_ttl: Duration::from_secs(env_u64("A1_CACHE_TTL_S", DEFAULT_CACHE_TTL_S)?),
            stale_threshold: Duration::from_secs(env_u64(
                "A1_STALE_THRESHOLD_S",
                DEFAULT_STALE_THRESHOLD_S,
            )?),
            llm_url: env::var("A1_LLM_URL").unwrap_or_else(|_| DEFAULT_LLM_URL.to_string()),
            llm_model_preference,
            db_path: resolve_db_path(env::var("A1_DB_URL").ok()),
            retention_days: env_u64("A1_RETENTION_DAYS", DEFAULT_RETENTION_DAYS as u64)? as i64,
            alert_slack_webhook: env_opt("A1_ALERT_SLACK_WEBHOOK"),
            alert_email: env_opt("A1_ALERT_EMAIL"),
            sentry_dsn: env_opt("A1_SENTRY_DSN"),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let (lo, hi) = raw
        .split_once('-')
        .with_context(|| format!("A1_PORT_RANGE must look like 8000-8010, got {raw:?}"))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .with_context(|| format!("invalid low port in A1_PORT_RANGE {raw:?}"))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .with_context(|| format!("invalid high port in A1_PORT_RANGE {raw:?}"))?;
    if lo == 0 || lo > hi {
        bail!("A1_PORT_RANGE must be a non-empty ascending range, got {raw:?}");
    }
    Ok((lo, hi))
}

fn parse_backoff_schedule(raw: &str) -> Result<Vec<Duration>> {
    let schedule: Vec<Duration> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("invalid entry {s:?} in A1_BACKOFF_SCHEDULE_S"))
        })
        .collect::<Result<_>>()?;
    if schedule.is_empty() {
        bail!("A1_BACKOFF_SCHEDULE_S must contain at least one delay");
    }
    Ok(schedule)
}

/// Relative DB paths are anchored to the crate directory, not the caller's
/// cwd, so running from elsewhere never creates a second empty database.
fn resolve_db_path(env_value: Option<String>) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(DEFAULT_DB_FILE).to_string_lossy().to_string();
    };

    let p = PathBuf::from(&raw);
    if p.is_absolute() {
        return raw;
    }
    base.join(p).to_string_lossy().to_string()
}
