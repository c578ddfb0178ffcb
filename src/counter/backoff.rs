//! Retry policy for optimistic commits.
//!
//! Attempt numbering starts at 1 for the first commit attempt. The delay
//! returned for attempt `n` is slept after attempt `n` aborts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, StoregateError};

/// Default number of commit attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default pause between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay every time.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the given (1-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_BACKOFF)
    }
}

/// Randomisation applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    /// Use the delay as is.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay / 2, delay]`.
    Equal,
}

impl Jitter {
    /// Apply jitter using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            _ if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.gen_range(millis / 2..=millis)),
        }
    }
}

/// Bounded retry policy for the optimistic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total commit attempts, including the first
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff: Backoff,
    /// Randomisation applied to each delay
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` and the default fixed backoff.
    pub fn new(max_attempts: u32) -> Result<Self> {
        let policy = Self {
            max_attempts,
            ..Self::default()
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Keep retrying for as long as it takes.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: u32::MAX,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Reject policies that could never commit.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(StoregateError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let Backoff::Exponential { base, max } = self.backoff {
            if max < base {
                return Err(StoregateError::Config(format!(
                    "max backoff ({:?}) must be >= base ({:?})",
                    max, base
                )));
            }
        }
        Ok(())
    }

    /// Jittered delay to sleep after `attempt` aborts.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }
}
