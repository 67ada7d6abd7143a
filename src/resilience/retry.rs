//! Retry with exponential backoff and jitter.

use crate::upstream::UpstreamError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Adds a uniform `[0, base_delay)` jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    pub fn max_attempts(&self) -> u32 {
        self.cfg.max_attempts.max(1)
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based),
    /// without jitter: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self
            .cfg
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.cfg.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Full delay: base backoff plus jitter, floored by a provider
    /// `Retry-After` hint, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let mut ms = self.base_delay(attempt).as_millis() as u64;
        if self.cfg.jitter && self.cfg.base_delay_ms > 0 {
            ms = ms.saturating_add(rand::thread_rng().gen_range(0..self.cfg.base_delay_ms));
        }
        if let Some(floor) = retry_after_ms {
            ms = ms.max(floor);
        }
        Duration::from_millis(ms.min(self.cfg.max_delay_ms))
    }

    /// Decide after failed attempt `attempt` (1-based).
    ///
    /// `max_attempts` overrides the configured budget; a half-open probe passes 1.
    pub fn decide(&self, err: &UpstreamError, attempt: u32, max_attempts: u32) -> RetryDecision {
        if !err.retryable() || attempt >= max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempt, err.retry_after_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
