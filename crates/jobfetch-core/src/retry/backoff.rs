//! Delay schedules for the individual retry strategies.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

use super::classify::{classify, ErrorKind};
use super::context::AttemptContext;
use super::policy::RetryRules;

/// `initial * factor^attempt`, capped at `max`. Saturates to `max` on overflow.
pub fn exponential_delay(initial: Duration, factor: f64, attempt: u32, max: Duration) -> Duration {
    let exp = attempt.min(1024) as i32;
    let raw = initial.as_secs_f64() * factor.powi(exp);
    if !raw.is_finite() || raw >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(raw.max(0.0))
}

/// Constant delay between attempts (also configured as "linear").
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl FixedBackoff {
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial_delay, self.backoff_factor, attempt, self.max_delay)
    }
}

/// Past this index every term saturates at `u64::MAX`.
const MAX_FIBONACCI_TERMS: usize = 94;

/// Delays follow 1, 1, 2, 3, 5, ... times `initial_delay`, capped at `max_delay`.
///
/// The sequence is extended lazily and cached; concurrent callers share the cache.
/// It never grows past the first term that reaches `max_delay`.
#[derive(Debug)]
pub struct FibonacciBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    sequence: Mutex<Vec<u64>>,
}

impl FibonacciBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            sequence: Mutex::new(vec![1, 1]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u64>> {
        self.sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn scaled(&self, term: u64) -> f64 {
        self.initial_delay.as_secs_f64() * term as f64
    }

    /// Extend `seq` up to `index`, stopping early once the last term is
    /// capped (when `stop_at_cap`) or saturated.
    fn extend(&self, seq: &mut Vec<u64>, index: usize, stop_at_cap: bool) {
        let target = index.min(MAX_FIBONACCI_TERMS - 1);
        let cap = self.max_delay.as_secs_f64();
        while seq.len() <= target {
            let n = seq.len();
            if stop_at_cap && self.scaled(seq[n - 1]) >= cap {
                break;
            }
            let next = seq[n - 1].saturating_add(seq[n - 2]);
            seq.push(next);
        }
    }

    /// Fibonacci number for a 1-based attempt (attempt 0 is treated as 1).
    /// Saturates at `u64::MAX`.
    pub fn term(&self, attempt: u32) -> u64 {
        let index = attempt.max(1) as usize - 1;
        let mut seq = self.lock();
        self.extend(&mut seq, index, false);
        seq.get(index).copied().unwrap_or(u64::MAX)
    }

    /// Number of terms computed so far.
    pub fn cached_terms(&self) -> usize {
        self.lock().len()
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let index = attempt.max(1) as usize - 1;
        let term = {
            let mut seq = self.lock();
            self.extend(&mut seq, index, true);
            // Beyond the cache the sequence only grows, so the last term bounds it from below.
            seq.get(index).or(seq.last()).copied().unwrap_or(1)
        };
        let raw = self.scaled(term);
        if !raw.is_finite() || raw >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(raw)
    }
}

/// Exponential delay spread by a uniformly random `±jitter_factor` of itself,
/// so identifiers failing together do not retry together.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    pub base: ExponentialBackoff,
    pub jitter_factor: f64,
}

impl JitteredBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.delay(attempt).as_secs_f64();
        let spread = base * self.jitter_factor;
        if spread <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

/// Picks the delay from the kind of failure.
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    pub default_delay: Duration,
    pub rate_limit_delay: Duration,
    pub forbidden_delay: Duration,
    /// Used for server errors.
    pub server_error: ExponentialBackoff,
}

impl AdaptiveBackoff {
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.default_delay
    }

    pub fn delay_for(&self, ctx: &AttemptContext, rules: &RetryRules) -> Duration {
        let kind = classify(
            ctx.last_status_code,
            ctx.last_error.as_ref(),
            &rules.retryable_status_codes,
        );
        match kind {
            ErrorKind::RateLimited => {
                let hint = ctx.last_error.as_ref().and_then(|e| e.retry_after());
                match hint {
                    Some(d) if rules.honor_retry_after => d,
                    _ => self.rate_limit_delay,
                }
            }
            ErrorKind::ServerError => self.server_error.delay(ctx.attempt),
            ErrorKind::Forbidden => self.forbidden_delay,
            ErrorKind::Transient | ErrorKind::Terminal => self.default_delay,
        }
    }
}
