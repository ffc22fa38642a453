//! Runtime configuration loaded from the environment.

use std::time::Duration;

use thiserror::Error;

use crate::command_dispatcher::DispatcherConfig;
use crate::delivery::FeedConfig;

pub const MAX_ATTEMPTS: &str = "COVENANT_MAX_ATTEMPTS";
pub const RETRY_BACKOFF_MS: &str = "COVENANT_RETRY_BACKOFF_MS";
pub const SEND_TIMEOUT_MS: &str = "COVENANT_SEND_TIMEOUT_MS";
pub const POLL_INTERVAL_MS: &str = "COVENANT_POLL_INTERVAL_MS";
pub const DELIVERY_BATCH_SIZE: &str = "COVENANT_DELIVERY_BATCH_SIZE";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: `{value}` is not a valid number")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Dispatcher attempts per command when conflicts occur.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Default deadline for `send_with_timeout` callers; `None` = unbounded.
    pub send_timeout: Option<Duration>,
    /// Delivery worker poll tick.
    pub poll_interval: Duration,
    /// Events per `read_all` page.
    pub delivery_batch_size: usize,
    pub database_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            send_timeout: None,
            poll_interval: Duration::from_millis(250),
            delivery_batch_size: 256,
            database_url: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse::<u32>(&lookup, MAX_ATTEMPTS)? {
            if v == 0 {
                return Err(ConfigError::Zero(MAX_ATTEMPTS));
            }
            config.max_attempts = v;
        }
        if let Some(ms) = parse::<u64>(&lookup, RETRY_BACKOFF_MS)? {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, SEND_TIMEOUT_MS)? {
            config.send_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, POLL_INTERVAL_MS)? {
            if ms == 0 {
                return Err(ConfigError::Zero(POLL_INTERVAL_MS));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<usize>(&lookup, DELIVERY_BATCH_SIZE)? {
            if n == 0 {
                return Err(ConfigError::Zero(DELIVERY_BATCH_SIZE));
            }
            config.delivery_batch_size = n;
        }
        config.database_url = lookup(DATABASE_URL).filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_max_attempts(self.max_attempts)
            .with_retry_backoff(self.retry_backoff)
    }

    pub fn feed(&self) -> FeedConfig {
        FeedConfig::default().with_batch_size(self.delivery_batch_size)
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
    }
}
