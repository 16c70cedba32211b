//! Bounded retry schedule shared by the media join, settle and subscribe paths.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before attempt `n + 1`, given `n` failed attempts so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { step_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    pub fn delay_after(&self, failures: u32) -> Duration {
        let ms = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(failures as u64),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(failures.saturating_sub(1)).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Linear {
                step_ms: step.as_millis() as u64,
            },
        )
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// `None` once the budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.attempts() {
            None
        } else {
            Some(self.backoff.delay_after(failures))
        }
    }
}
