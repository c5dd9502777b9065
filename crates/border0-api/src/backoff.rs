//! Backoff schedules.
//!
//! Two shapes are used across the SDK:
//!
//! - [`exponential`]: the stateless `min·2^i` capped curve the retrying
//!   executor sleeps on between attempts;
//! - [`ExponentialBackoff`]: a stateful schedule with a multiplier, optional
//!   jitter and an optional total deadline, used for device-authorization
//!   polling and for tunnel reconnects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

/// Signature of a pluggable executor backoff: `(min, max, attempt) -> delay`.
pub type BackoffFn = Arc<dyn Fn(Duration, Duration, u32) -> Duration + Send + Sync>;

/// `min(max, min·2^attempt)`, saturating instead of overflowing.
#[must_use]
pub fn exponential(min: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    min.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

/// The default executor backoff as a [`BackoffFn`].
#[must_use]
pub fn default_backoff() -> BackoffFn {
    Arc::new(exponential)
}

/// A backoff that never sleeps. Handy in tests.
#[must_use]
pub fn zero_backoff() -> BackoffFn {
    Arc::new(|_, _, _| Duration::ZERO)
}

/// Parameters of an [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a reset.
    pub initial: Duration,
    /// Upper bound for a single delay (before jitter).
    pub max: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter as a fraction of the current delay, in `[0, 1]`.
    pub randomization_factor: f64,
    /// Give up once this much time has passed since the last reset.
    pub max_elapsed: Option<Duration>,
}

impl BackoffConfig {
    /// Device-authorization polling: 1 s initial, 5 s cap, ×1.3, 3 minutes total.
    #[must_use]
    pub const fn device_poll() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            multiplier: 1.3,
            randomization_factor: 0.0,
            max_elapsed: Some(Duration::from_secs(180)),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_elapsed: None,
        }
    }
}

/// Stateful exponential backoff.
///
/// Each call to [`next_delay`](Self::next_delay) returns the current delay
/// and advances the schedule. [`reset`](Self::reset) rewinds it to the
/// initial delay and restarts the elapsed-time budget.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Instant,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a schedule positioned at its initial delay.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            started: Instant::now(),
            attempt: 0,
        }
    }

    /// The next delay to sleep, or `None` once the elapsed budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.config.max_elapsed {
            if self.started.elapsed() >= max_elapsed {
                return None;
            }
        }

        self.attempt += 1;
        let delay = self.jittered(self.current);

        self.current = self.grown(self.current);

        debug!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Backoff advanced"
        );

        Some(delay)
    }

    /// Rewind to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.started = Instant::now();
        self.attempt = 0;
    }

    /// The un-jittered delay the next call will be based on.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Time left in the elapsed budget, or `None` for an unbounded schedule.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.config
            .max_elapsed
            .map(|max_elapsed| max_elapsed.saturating_sub(self.started.elapsed()))
    }

    /// Delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `delay · multiplier`, capped at `max`; an unusable product saturates
    /// to `max` and a shrinking one holds at `delay`.
    fn grown(&self, delay: Duration) -> Duration {
        let product = delay.as_secs_f64() * self.config.multiplier;
        Duration::try_from_secs_f64(product)
            .map_or(self.config.max, |next| next.max(delay))
            .min(self.config.max)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let factor = self.config.randomization_factor;
        if factor.is_nan() || factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let delta = secs * factor.min(1.0);
        let jittered = rand::thread_rng().gen_range((secs - delta)..=(secs + delta));
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(delay)
    }
}
