use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Lower bound of the jitter band applied to every computed delay.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter band.
pub const JITTER_MAX: f64 = 1.2;

/// Source of jitter factors in `[JITTER_MIN, JITTER_MAX]`.
///
/// The policy is deterministic given a fixed source, which is what the
/// timing tests rely on.
pub trait JitterSource: Send + Sync {
    fn next_factor(&mut self) -> f64;
}

/// Production jitter: uniform draws from a seeded RNG.
pub struct RandomJitter {
    rng: StdRng,
}

impl RandomJitter {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded constructor for reproducible runs.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomJitter {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterSource for RandomJitter {
    fn next_factor(&mut self) -> f64 {
        self.rng.gen_range(JITTER_MIN..=JITTER_MAX)
    }
}

/// Constant jitter factor, for tests.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn next_factor(&mut self) -> f64 {
        self.0
    }
}

/// What to do after a failed remote attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule another remote attempt after this delay.
    Delay(Duration),
    /// Retry budget exhausted; hand the segment to the local fallback.
    Fallback,
}

/// Pure exponential-backoff policy.
///
/// The delay before attempt `n + 1`, given `n` failures so far, is
/// `base_delay * 2^(n-1) * jitter`. The policy performs no I/O and never
/// sleeps; the caller owns the timer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt, pre-jitter.
    pub base_delay: Duration,
    /// Remote attempts allowed before dispatching the fallback.
    pub max_retries_before_fallback: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries_before_fallback: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay for the re-attempt following failure number `failure_count`
    /// (1-based).
    pub fn delay_for_attempt(&self, failure_count: u32, jitter: &mut dyn JitterSource) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(32);
        let scaled = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(scaled * jitter.next_factor())
    }

    /// Decide whether to schedule another remote attempt or give up and hand
    /// off to the fallback engine.
    pub fn decide(&self, failure_count: u32, jitter: &mut dyn JitterSource) -> RetryDecision {
        if failure_count >= self.max_retries_before_fallback {
            RetryDecision::Fallback
        } else {
            RetryDecision::Delay(self.delay_for_attempt(failure_count, jitter))
        }
    }
}
