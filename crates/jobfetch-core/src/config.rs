use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Status codes retried by default: access denial, rate limiting, gateway/server errors.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [403, 429, 500, 502, 503, 504];

/// Configuration errors detected at construction time. These are the only
/// fatal conditions of a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_concurrent must be greater than zero")]
    ZeroConcurrency,
    #[error("window_size must be greater than zero")]
    ZeroWindow,
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff_factor must be greater than 1 (got {0})")]
    BackoffFactor(f64),
    #[error("jitter_factor must be within 0..=1 (got {0})")]
    JitterFactor(f64),
    #[error("{field} must be a finite, non-negative number of seconds (got {value})")]
    Duration { field: &'static str, value: f64 },
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    #[error("unknown retry strategy '{0}' (expected fixed, linear, exponential, fibonacci, jitter, adaptive or circuit_breaker)")]
    UnknownStrategy(String),
}

/// Convert a seconds value from config into a `Duration`, rejecting negatives and NaN.
pub fn secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Duration { field, value });
    }
    Ok(Duration::from_secs_f64(value))
}

/// Retry policy parameters (`[retry]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Strategy name: fixed (alias linear), exponential, fibonacci, jitter, adaptive, circuit_breaker.
    pub strategy: String,
    /// Maximum number of attempts per identifier and pass (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds (constant delay for the fixed strategy).
    pub initial_delay_secs: f64,
    /// Upper bound on computed backoff delays, in seconds.
    pub max_delay_secs: f64,
    /// Multiplier per attempt for exponential-style strategies.
    pub backoff_factor: f64,
    /// Fraction of the delay used as random +/- spread by the jitter strategy.
    pub jitter_factor: f64,
    pub retryable_status_codes: BTreeSet<u16>,
    /// Adaptive strategy: delay after a rate-limit response.
    pub rate_limit_delay_secs: f64,
    /// Adaptive strategy: delay after an access-denied (403) response.
    pub forbidden_delay_secs: f64,
    /// Use the server's wait hint (Retry-After) when a rate-limit failure carries one.
    pub honor_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: "exponential".to_string(),
            max_attempts: 5,
            initial_delay_secs: 2.0,
            max_delay_secs: 120.0,
            backoff_factor: 2.0,
            jitter_factor: 0.3,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            rate_limit_delay_secs: 60.0,
            forbidden_delay_secs: 30.0,
            honor_retry_after: true,
        }
    }
}

/// Circuit breaker thresholds (`[circuit_breaker]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds after the last failure before an open circuit lets a trial request through.
    pub recovery_timeout_secs: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout_secs: 120.0,
        }
    }
}

/// Paginated search limits (`[search]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Stop once this many items were collected (None = all pages).
    pub max_results: Option<usize>,
    /// Never request more pages than this (the upstream API stops paging at 20).
    pub max_pages: Option<u32>,
    /// Pages requested per window.
    pub window_size: usize,
    pub window_delay_secs: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: None,
            max_pages: Some(20),
            window_size: 5,
            window_delay_secs: 0.5,
        }
    }
}

/// Global configuration loaded from `~/.config/jobfetch/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum number of simultaneously in-flight fetch operations.
    pub max_concurrent: usize,
    /// Identifiers issued per dispatch window.
    pub window_size: usize,
    /// Pause after each window of identifiers is issued, in seconds.
    #[serde(default = "default_window_delay")]
    pub window_delay_secs: f64,
    /// Pause between the main pass and the failure re-drive pass, in seconds.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: f64,
    /// Where the pipeline persists unresolved failures after each pass (None = don't persist).
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

fn default_window_delay() -> f64 {
    1.0
}

fn default_settle_delay() -> f64 {
    5.0
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            window_size: 20,
            window_delay_secs: default_window_delay(),
            settle_delay_secs: default_settle_delay(),
            ledger_path: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Check every option the engine relies on, including the strategy name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.window_size == 0 || self.search.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        secs("window_delay_secs", self.window_delay_secs)?;
        secs("settle_delay_secs", self.settle_delay_secs)?;
        secs("search.window_delay_secs", self.search.window_delay_secs)?;
        self.retry.validate()?;
        self.circuit_breaker.validate()
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if !(self.backoff_factor > 1.0) || !self.backoff_factor.is_finite() {
            return Err(ConfigError::BackoffFactor(self.backoff_factor));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::JitterFactor(self.jitter_factor));
        }
        secs("retry.initial_delay_secs", self.initial_delay_secs)?;
        secs("retry.max_delay_secs", self.max_delay_secs)?;
        secs("retry.rate_limit_delay_secs", self.rate_limit_delay_secs)?;
        secs("retry.forbidden_delay_secs", self.forbidden_delay_secs)?;
        self.strategy.parse::<crate::retry::StrategyKind>()?;
        Ok(())
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        secs("circuit_breaker.recovery_timeout_secs", self.recovery_timeout_secs)?;
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("jobfetch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
/// The loaded config is validated before it is returned.
pub fn load_or_init() -> Result<FetchConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = FetchConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: FetchConfig = toml::from_str(&data)?;
    cfg.validate()?;
    Ok(cfg)
}
