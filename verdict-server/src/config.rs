use anyhow::{bail, Context, Result};
use chrono::Duration;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use verdict_core::ModerationPolicy;

use crate::worker::WorkerConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub grace_period_days: u32,
    pub reminder_offset_days: Vec<u32>,
    pub request_ttl_days: u32,
    pub min_response_chars: usize,
    /// Review limit for businesses without a plan.
    pub default_review_limit: u32,
    pub sweep_interval_secs: u64,
    pub worker_poll_interval_secs: u64,
    pub worker_batch_size: usize,
    pub job_max_attempts: u32,
    pub reminder_max_attempts: u32,
    pub job_retry_base_secs: u64,
    pub job_retry_max_secs: u64,
    pub job_timeout_secs: u64,
    pub job_lease_secs: u64,
    /// Optional bearer token for /status endpoint authentication.
    /// If set, requests to /status must include `Authorization: Bearer <token>`.
    /// If not set, /status endpoint is disabled (returns 403 Forbidden).
    pub status_auth_token: Option<String>,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env_or("PORT", 3000u16)?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let grace_period_days = env_or("GRACE_PERIOD_DAYS", 7u32)?;
        if grace_period_days == 0 {
            bail!("GRACE_PERIOD_DAYS must be at least 1");
        }

        let reminder_offset_days = parse_reminder_offsets(
            &env::var("REMINDER_OFFSET_DAYS").unwrap_or_else(|_| "3,5,6".to_string()),
            grace_period_days,
        )
        .context("REMINDER_OFFSET_DAYS is invalid")?;

        let job_max_attempts = env_or("JOB_MAX_ATTEMPTS", 5u32)?;
        let reminder_max_attempts = env_or("REMINDER_MAX_ATTEMPTS", 2u32)?;
        if job_max_attempts == 0 || reminder_max_attempts == 0 {
            bail!("JOB_MAX_ATTEMPTS and REMINDER_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Config {
            port,
            state_dir,
            grace_period_days,
            reminder_offset_days,
            request_ttl_days: env_or("REQUEST_TTL_DAYS", 7u32)?,
            min_response_chars: env_or("MIN_RESPONSE_CHARS", 10usize)?,
            default_review_limit: env_or("DEFAULT_REVIEW_LIMIT", 50u32)?,
            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", 3600u64)?.max(1),
            worker_poll_interval_secs: env_or("WORKER_POLL_INTERVAL_SECS", 5u64)?.max(1),
            worker_batch_size: env_or("WORKER_BATCH_SIZE", 32usize)?.max(1),
            job_max_attempts,
            reminder_max_attempts,
            job_retry_base_secs: env_or("JOB_RETRY_BASE_SECS", 30u64)?,
            job_retry_max_secs: env_or("JOB_RETRY_MAX_SECS", 3600u64)?,
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", 30u64)?.max(1),
            job_lease_secs: env_or("JOB_LEASE_SECS", 300u64)?.max(1),
            status_auth_token: parse_status_auth_token(env::var("STATUS_AUTH_TOKEN").ok()),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("verdict-state.db")
    }

    pub fn policy(&self) -> ModerationPolicy {
        ModerationPolicy {
            grace_period: Duration::days(i64::from(self.grace_period_days)),
            reminder_offsets_days: self.reminder_offset_days.clone(),
            request_ttl: Duration::days(i64::from(self.request_ttl_days)),
            min_response_chars: self.min_response_chars,
            ..ModerationPolicy::default()
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.worker_batch_size,
            lease: secs(self.job_lease_secs),
            job_timeout: std::time::Duration::from_secs(self.job_timeout_secs),
            max_attempts: self.job_max_attempts,
            reminder_max_attempts: self.reminder_max_attempts,
            retry_base: secs(self.job_retry_base_secs),
            retry_max: secs(self.job_retry_max_secs),
        }
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Parse a comma-separated list of reminder offsets in days.
///
/// Offsets must be at least 1 and strictly less than the grace period; the
/// result is sorted and deduplicated. An empty string disables reminders.
pub fn parse_reminder_offsets(value: &str, grace_period_days: u32) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let offset: u32 = part
            .parse()
            .with_context(|| format!("'{}' is not a number of days", part))?;
        if offset == 0 || offset >= grace_period_days {
            bail!(
                "reminder offset {} must be between 1 and {}",
                offset,
                grace_period_days.saturating_sub(1)
            );
        }
        offsets.push(offset);
    }
    offsets.sort_unstable();
    offsets.dedup();
    Ok(offsets)
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace.
/// This prevents security issues where an empty token would allow unauthenticated access.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
