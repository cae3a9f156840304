use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{BreakerEvent, CircuitBreaker};
use crate::config::{secs, CircuitBreakerConfig, ConfigError, RetryConfig, DEFAULT_RETRYABLE_STATUS_CODES};

use super::backoff::{
    AdaptiveBackoff, ExponentialBackoff, FibonacciBackoff, FixedBackoff, JitteredBackoff,
};
use super::classify::classify;
use super::context::AttemptContext;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this identifier.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Retry conditions shared by every strategy.
#[derive(Debug, Clone)]
pub struct RetryRules {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub retryable_status_codes: BTreeSet<u16>,
    /// Prefer a rate-limit failure's wait hint over the computed delay.
    pub honor_retry_after: bool,
}

impl Default for RetryRules {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            honor_retry_after: true,
        }
    }
}

impl RetryRules {
    /// Another attempt is allowed while the budget lasts and the failure is not terminal.
    pub fn allows(&self, ctx: &AttemptContext) -> bool {
        if ctx.attempt >= self.max_attempts {
            return false;
        }
        classify(
            ctx.last_status_code,
            ctx.last_error.as_ref(),
            &self.retryable_status_codes,
        )
        .is_retryable()
    }
}

/// Names accepted by the `retry.strategy` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Fixed,
    Exponential,
    Fibonacci,
    Jitter,
    Adaptive,
    CircuitBreaker,
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "linear" => Ok(StrategyKind::Fixed),
            "exponential" => Ok(StrategyKind::Exponential),
            "fibonacci" => Ok(StrategyKind::Fibonacci),
            "jitter" => Ok(StrategyKind::Jitter),
            "adaptive" => Ok(StrategyKind::Adaptive),
            "circuit_breaker" | "circuit-breaker" => Ok(StrategyKind::CircuitBreaker),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

/// Exponential backoff gated by a shared circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerBackoff {
    pub backoff: ExponentialBackoff,
    pub breaker: Arc<CircuitBreaker>,
}

/// Retry strategy: when to try again and how long to wait.
#[derive(Debug)]
pub enum RetryPolicy {
    Fixed(RetryRules, FixedBackoff),
    Exponential(RetryRules, ExponentialBackoff),
    Fibonacci(RetryRules, FibonacciBackoff),
    Jitter(RetryRules, JitteredBackoff),
    Adaptive(RetryRules, AdaptiveBackoff),
    CircuitBreaker(RetryRules, BreakerBackoff),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential(
            RetryRules::default(),
            ExponentialBackoff {
                initial_delay: Duration::from_secs(2),
                backoff_factor: 2.0,
                max_delay: Duration::from_secs(120),
            },
        )
    }
}

impl RetryPolicy {
    /// Build the strategy named by `cfg.strategy`.
    pub fn from_config(
        cfg: &RetryConfig,
        breaker_cfg: &CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let kind: StrategyKind = cfg.strategy.parse()?;
        let rules = RetryRules {
            max_attempts: cfg.max_attempts,
            retryable_status_codes: cfg.retryable_status_codes.clone(),
            honor_retry_after: cfg.honor_retry_after,
        };
        let initial_delay = secs("retry.initial_delay_secs", cfg.initial_delay_secs)?;
        let max_delay = secs("retry.max_delay_secs", cfg.max_delay_secs)?;
        let exponential = ExponentialBackoff {
            initial_delay,
            backoff_factor: cfg.backoff_factor,
            max_delay,
        };

        let policy = match kind {
            StrategyKind::Fixed => RetryPolicy::Fixed(
                rules,
                FixedBackoff {
                    delay: initial_delay,
                },
            ),
            StrategyKind::Exponential => RetryPolicy::Exponential(rules, exponential),
            StrategyKind::Fibonacci => {
                RetryPolicy::Fibonacci(rules, FibonacciBackoff::new(initial_delay, max_delay))
            }
            StrategyKind::Jitter => RetryPolicy::Jitter(
                rules,
                JitteredBackoff {
                    base: exponential,
                    jitter_factor: cfg.jitter_factor,
                },
            ),
            StrategyKind::Adaptive => RetryPolicy::Adaptive(
                rules,
                AdaptiveBackoff {
                    default_delay: initial_delay,
                    rate_limit_delay: secs("retry.rate_limit_delay_secs", cfg.rate_limit_delay_secs)?,
                    forbidden_delay: secs("retry.forbidden_delay_secs", cfg.forbidden_delay_secs)?,
                    server_error: exponential,
                },
            ),
            StrategyKind::CircuitBreaker => {
                breaker_cfg.validate()?;
                let recovery = secs(
                    "circuit_breaker.recovery_timeout_secs",
                    breaker_cfg.recovery_timeout_secs,
                )?;
                RetryPolicy::CircuitBreaker(
                    rules,
                    BreakerBackoff {
                        backoff: exponential,
                        breaker: Arc::new(CircuitBreaker::new(
                            breaker_cfg.failure_threshold,
                            recovery,
                        )),
                    },
                )
            }
        };
        Ok(policy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RetryPolicy::Fixed(..) => "fixed",
            RetryPolicy::Exponential(..) => "exponential",
            RetryPolicy::Fibonacci(..) => "fibonacci",
            RetryPolicy::Jitter(..) => "jitter",
            RetryPolicy::Adaptive(..) => "adaptive",
            RetryPolicy::CircuitBreaker(..) => "circuit_breaker",
        }
    }

    pub fn rules(&self) -> &RetryRules {
        match self {
            RetryPolicy::Fixed(rules, _)
            | RetryPolicy::Exponential(rules, _)
            | RetryPolicy::Fibonacci(rules, _)
            | RetryPolicy::Jitter(rules, _)
            | RetryPolicy::Adaptive(rules, _)
            | RetryPolicy::CircuitBreaker(rules, _) => rules,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.rules().max_attempts
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        match self {
            RetryPolicy::CircuitBreaker(_, b) => Some(&b.breaker),
            _ => None,
        }
    }

    /// Whether the identifier in `ctx` should get another attempt.
    ///
    /// An open circuit refuses every retry regardless of the attempt count.
    pub fn should_retry(&self, ctx: &AttemptContext) -> bool {
        if let Some(breaker) = self.breaker() {
            if !breaker.allows_retry() {
                return false;
            }
        }
        self.rules().allows(ctx)
    }

    /// Delay before the attempt following `attempt`.
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Fixed(_, b) => b.delay(attempt),
            RetryPolicy::Exponential(_, b) => b.delay(attempt),
            RetryPolicy::Fibonacci(_, b) => b.delay(attempt),
            RetryPolicy::Jitter(_, b) => b.delay(attempt),
            RetryPolicy::Adaptive(_, b) => b.delay(attempt),
            RetryPolicy::CircuitBreaker(_, b) => b.backoff.delay(attempt),
        }
    }

    /// Delay for a specific failure; only the adaptive strategy looks past the attempt number.
    pub fn delay_for(&self, ctx: &AttemptContext) -> Duration {
        match self {
            RetryPolicy::Adaptive(rules, b) => b.delay_for(ctx, rules),
            _ => self.get_delay(ctx.attempt),
        }
    }

    pub fn decide(&self, ctx: &AttemptContext) -> RetryDecision {
        if !self.should_retry(ctx) {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.delay_for(ctx))
    }

    /// Apply any pending circuit transition that is due by now.
    pub fn poll_breaker(&self) -> Option<BreakerEvent> {
        self.breaker().and_then(|b| b.refresh())
    }

    /// Feed a failed attempt into aggregate state (the circuit breaker).
    pub fn on_failure(&self) -> Option<BreakerEvent> {
        self.breaker().and_then(|b| b.record_failure())
    }

    /// Feed a successful attempt into aggregate state (the circuit breaker).
    pub fn on_success(&self) -> Option<BreakerEvent> {
        self.breaker().and_then(|b| b.record_success())
    }
}
