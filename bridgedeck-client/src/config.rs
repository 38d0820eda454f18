use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use bridgedeck_core::{MAX_RECONNECT_ATTEMPTS, SNAPSHOT_STALE_AFTER, STATUS_RETRY_BACKOFF, STATUS_RETRY_LIMIT};
use thiserror::Error;
use url::Url;

pub const MAX_BASE_URL_LEN: usize = 2048;
pub const STATE_DIR_ENV: &str = "BRIDGEDECK_STATE_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Please fix the following:\n\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

/// Every interval, pause and cap the console uses. Tests shrink these.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub base_url: Url,
    /// Console URL whose `token` query parameter is the highest-priority
    /// credential location.
    pub navigation_url: Option<Url>,
    pub status_interval: Duration,
    pub admin_status_interval: Duration,
    pub pairing_interval: Duration,
    pub connect_settle: Duration,
    pub step_pause: Duration,
    pub status_retry_limit: u32,
    pub status_retry_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub validation_wait_cap: Duration,
    pub snapshot_max_age: Duration,
    pub request_timeout: Duration,
}

impl ConsoleConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            navigation_url: None,
            status_interval: Duration::from_secs(5),
            admin_status_interval: Duration::from_secs(10),
            pairing_interval: Duration::from_secs(3),
            connect_settle: Duration::from_secs(1),
            step_pause: Duration::from_secs(1),
            status_retry_limit: STATUS_RETRY_LIMIT,
            status_retry_backoff: STATUS_RETRY_BACKOFF,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            validation_wait_cap: Duration::from_secs(5),
            snapshot_max_age: SNAPSHOT_STALE_AFTER,
            request_timeout: Duration::from_secs(15),
        }
    }

    pub fn from_base_url(raw: &str) -> Result<Self, ConfigError> {
        validate_base_url(raw).map(Self::new)
    }

    #[must_use]
    pub fn with_navigation_url(mut self, url: Url) -> Self {
        self.navigation_url = Some(url);
        self
    }
}

pub fn validate_base_url(raw: &str) -> Result<Url, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let raw = raw.trim();

    let mut parsed = None;
    if raw.is_empty() {
        errors.push("Gateway URL is required.".to_owned());
    } else if raw.len() > MAX_BASE_URL_LEN {
        errors.push(format!(
            "Gateway URL is too long ({} > {} chars).",
            raw.len(),
            MAX_BASE_URL_LEN
        ));
    } else {
        match Url::parse(raw) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    errors.push("Gateway URL must start with http:// or https://.".to_owned());
                }
                if url.host_str().is_none() {
                    errors.push("Gateway URL must include a host.".to_owned());
                }
                parsed = Some(url);
            }
            Err(err) => errors.push(format!("Gateway URL is invalid: {err}")),
        }
    }

    match parsed {
        Some(url) if errors.is_empty() => Ok(url),
        _ => Err(ConfigError::Invalid(errors)),
    }
}

/// Explicit directory, then `BRIDGEDECK_STATE_DIR`, then `~/.bridgedeck`.
pub fn resolve_state_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bridgedeck")
}
