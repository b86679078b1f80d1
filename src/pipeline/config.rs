//! Pipeline configuration.
//!
//! Every option has a default, can be overridden from the environment via
//! [`PipelineConfig::from_env`], and can be set programmatically with the
//! `with_*` builders. [`PipelineConfig::validate`] is called by `from_env`
//! and by the pipeline constructor.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::RateLimit;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the discovery and enrichment pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Storage
    /// SQLite URL or file path.
    pub database_url: String,
    /// Timeout for each storage round trip.
    pub db_timeout: Duration,

    // Detail API
    pub github_token: Option<String>,
    /// Outbound detail requests allowed per window.
    pub rate_limit: RateLimit,
    pub fetch_timeout: Duration,
    /// Longest a worker waits for a rate-limiter permit.
    pub permit_timeout: Duration,

    // Queue and worker pool
    /// Items claimed per cycle.
    pub batch_size: usize,
    /// Concurrent detail requests. Never larger than `batch_size`.
    pub max_concurrency: usize,
    pub max_retries: u32,
    /// Minimum age of a failed attempt before it is requeued.
    pub retry_backoff: Duration,
    /// Age after which an `in_progress` claim may be taken over.
    pub in_progress_timeout: Duration,

    // Loop timing
    /// Sleep when the queue is empty.
    pub idle_interval: Duration,
    /// Sleep after a cycle fails on storage.
    pub error_backoff: Duration,
    /// Discovery also runs on this period while the queue is busy.
    pub discovery_interval: Duration,
    /// Candidates buffered before each enqueue.
    pub discovery_flush_size: usize,

    // Discovery sources
    pub archive_enabled: bool,
    /// Hours before now to start from when no archive hour is registered yet.
    pub archive_lookback_hours: u32,
    /// Archive hours harvested per discovery pass.
    pub archive_hours_per_run: usize,
    pub search_enabled: bool,
    pub search_min_stars: u32,
    /// Creation-date window covered by one search pass.
    pub search_window_days: u32,
    /// Days before today where the search cursor starts.
    pub search_lookback_days: u32,

    // Query layer
    pub cache_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://repo_scout.db".to_string(),
            db_timeout: Duration::from_secs(30),

            github_token: None,
            rate_limit: RateLimit::new(75, Duration::from_secs(60)),
            fetch_timeout: Duration::from_secs(30),
            permit_timeout: Duration::from_secs(120),

            batch_size: 100,
            max_concurrency: 10,
            max_retries: 3,
            retry_backoff: Duration::from_secs(300),
            in_progress_timeout: Duration::from_secs(1800),

            idle_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(3600),
            discovery_flush_size: 1000,

            archive_enabled: true,
            archive_lookback_hours: 24,
            archive_hours_per_run: 6,
            search_enabled: false,
            search_min_stars: 10,
            search_window_days: 1,
            search_lookback_days: 30,

            cache_capacity: 100,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: SQLite URL (default: sqlite://repo_scout.db)
    /// - `GITHUB_TOKEN`: detail and search API token
    /// - `SCOUT_BATCH_SIZE`: items claimed per cycle (default: 100)
    /// - `SCOUT_MAX_CONCURRENCY`: concurrent detail requests (default: 10)
    /// - `SCOUT_RATE_LIMIT`: `permits/seconds` (default: 75/60)
    /// - `SCOUT_MAX_RETRIES`: attempts before an item is poisoned (default: 3)
    /// - `SCOUT_IN_PROGRESS_TIMEOUT_SECS`: stale claim age (default: 1800)
    /// - `SCOUT_CACHE_CAPACITY`: query cache entries (default: 100)
    /// - `SCOUT_FETCH_TIMEOUT_SECS`, `SCOUT_PERMIT_TIMEOUT_SECS`, `SCOUT_DB_TIMEOUT_SECS`
    /// - `SCOUT_RETRY_BACKOFF_SECS`, `SCOUT_IDLE_INTERVAL_SECS`, `SCOUT_ERROR_BACKOFF_SECS`
    /// - `SCOUT_DISCOVERY_INTERVAL_SECS`, `SCOUT_DISCOVERY_FLUSH_SIZE`
    /// - `SCOUT_ARCHIVE_ENABLED`, `SCOUT_ARCHIVE_LOOKBACK_HOURS`, `SCOUT_ARCHIVE_HOURS_PER_RUN`
    /// - `SCOUT_SEARCH_ENABLED`, `SCOUT_SEARCH_MIN_STARS`, `SCOUT_SEARCH_WINDOW_DAYS`,
    ///   `SCOUT_SEARCH_LOOKBACK_DAYS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = val;
        }
        if let Ok(val) = std::env::var("GITHUB_TOKEN") {
            if !val.trim().is_empty() {
                config.github_token = Some(val);
            }
        }

        if let Ok(val) = std::env::var("SCOUT_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "SCOUT_BATCH_SIZE")?;
        }
        if let Ok(val) = std::env::var("SCOUT_MAX_CONCURRENCY") {
            config.max_concurrency = parse_env_value(&val, "SCOUT_MAX_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("SCOUT_RATE_LIMIT") {
            config.rate_limit = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "SCOUT_RATE_LIMIT".to_string(),
                message,
            })?;
        }
        if let Ok(val) = std::env::var("SCOUT_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "SCOUT_MAX_RETRIES")?;
        }
        if let Ok(val) = std::env::var("SCOUT_CACHE_CAPACITY") {
            config.cache_capacity = parse_env_value(&val, "SCOUT_CACHE_CAPACITY")?;
        }
        if let Ok(val) = std::env::var("SCOUT_DISCOVERY_FLUSH_SIZE") {
            config.discovery_flush_size = parse_env_value(&val, "SCOUT_DISCOVERY_FLUSH_SIZE")?;
        }

        for (key, slot) in [
            ("SCOUT_IN_PROGRESS_TIMEOUT_SECS", &mut config.in_progress_timeout),
            ("SCOUT_FETCH_TIMEOUT_SECS", &mut config.fetch_timeout),
            ("SCOUT_PERMIT_TIMEOUT_SECS", &mut config.permit_timeout),
            ("SCOUT_DB_TIMEOUT_SECS", &mut config.db_timeout),
            ("SCOUT_RETRY_BACKOFF_SECS", &mut config.retry_backoff),
            ("SCOUT_IDLE_INTERVAL_SECS", &mut config.idle_interval),
            ("SCOUT_ERROR_BACKOFF_SECS", &mut config.error_backoff),
            ("SCOUT_DISCOVERY_INTERVAL_SECS", &mut config.discovery_interval),
        ] {
            if let Ok(val) = std::env::var(key) {
                *slot = Duration::from_secs(parse_env_value(&val, key)?);
            }
        }

        if let Ok(val) = std::env::var("SCOUT_ARCHIVE_ENABLED") {
            config.archive_enabled = parse_env_bool(&val, "SCOUT_ARCHIVE_ENABLED")?;
        }
        if let Ok(val) = std::env::var("SCOUT_ARCHIVE_LOOKBACK_HOURS") {
            config.archive_lookback_hours = parse_env_value(&val, "SCOUT_ARCHIVE_LOOKBACK_HOURS")?;
        }
        if let Ok(val) = std::env::var("SCOUT_ARCHIVE_HOURS_PER_RUN") {
            config.archive_hours_per_run = parse_env_value(&val, "SCOUT_ARCHIVE_HOURS_PER_RUN")?;
        }
        if let Ok(val) = std::env::var("SCOUT_SEARCH_ENABLED") {
            config.search_enabled = parse_env_bool(&val, "SCOUT_SEARCH_ENABLED")?;
        }
        if let Ok(val) = std::env::var("SCOUT_SEARCH_MIN_STARS") {
            config.search_min_stars = parse_env_value(&val, "SCOUT_SEARCH_MIN_STARS")?;
        }
        if let Ok(val) = std::env::var("SCOUT_SEARCH_WINDOW_DAYS") {
            config.search_window_days = parse_env_value(&val, "SCOUT_SEARCH_WINDOW_DAYS")?;
        }
        if let Ok(val) = std::env::var("SCOUT_SEARCH_LOOKBACK_DAYS") {
            config.search_lookback_days = parse_env_value(&val, "SCOUT_SEARCH_LOOKBACK_DAYS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("batch_size", self.batch_size),
            ("max_concurrency", self.max_concurrency),
            ("cache_capacity", self.cache_capacity),
            ("discovery_flush_size", self.discovery_flush_size),
            ("archive_hours_per_run", self.archive_hours_per_run),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.max_concurrency > self.batch_size {
            return Err(ConfigError::ValidationFailed(format!(
                "max_concurrency ({}) cannot exceed batch_size ({})",
                self.max_concurrency, self.batch_size
            )));
        }

        if self.rate_limit.permits == 0 || self.rate_limit.per.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rate_limit must allow at least one permit per non-empty window".to_string(),
            ));
        }

        for (name, value) in [
            ("fetch_timeout", self.fetch_timeout),
            ("permit_timeout", self.permit_timeout),
            ("db_timeout", self.db_timeout),
            ("in_progress_timeout", self.in_progress_timeout),
            ("idle_interval", self.idle_interval),
            ("error_backoff", self.error_backoff),
            ("discovery_interval", self.discovery_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        // A claim must not go stale while its batch can still be running.
        let hold = self.max_claim_hold();
        if self.in_progress_timeout <= hold {
            return Err(ConfigError::ValidationFailed(format!(
                "in_progress_timeout ({}s) must exceed the longest a batch can hold its claim ({}s)",
                self.in_progress_timeout.as_secs(),
                hold.as_secs()
            )));
        }

        if self.search_window_days == 0 {
            return Err(ConfigError::ValidationFailed(
                "search_window_days must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Upper bound on how long one cycle holds its claim.
    ///
    /// Each concurrency slot works through `ceil(batch_size / max_concurrency)`
    /// items, each waiting at most `permit_timeout` then `fetch_timeout`.
    /// Storing records and settling add one `db_timeout` each.
    pub fn max_claim_hold(&self) -> Duration {
        let waves = self.batch_size.div_ceil(self.max_concurrency.max(1));
        let waves = u32::try_from(waves).unwrap_or(u32::MAX);
        self.permit_timeout
            .checked_add(self.fetch_timeout)
            .and_then(|per_item| per_item.checked_mul(waves))
            .zip(self.db_timeout.checked_mul(2))
            .and_then(|(fetching, writes)| fetching.checked_add(writes))
            .unwrap_or(Duration::MAX)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_github_token(mut self, token: Option<String>) -> Self {
        self.github_token = token;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_in_progress_timeout(mut self, timeout: Duration) -> Self {
        self.in_progress_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_permit_timeout(mut self, timeout: Duration) -> Self {
        self.permit_timeout = timeout;
        self
    }

    pub fn with_db_timeout(mut self, timeout: Duration) -> Self {
        self.db_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_discovery_flush_size(mut self, size: usize) -> Self {
        self.discovery_flush_size = size;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_archive(mut self, enabled: bool) -> Self {
        self.archive_enabled = enabled;
        self
    }

    pub fn with_search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
