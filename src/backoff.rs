// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Policies
//!
//! Pure mappings from a 1-based attempt number to a wait duration. They drive
//! both the per-attempt delay of the delay queue and the redial wait of a
//! recovering connection. An attempt of `0` is treated as the first attempt.
//!
//! ```
//! use amqpx::backoff::{BackoffPolicy, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(
//!     Duration::from_secs(1),
//!     Duration::from_secs(2),
//!     2.0,
//!     Duration::from_secs(30),
//! );
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(2), Duration::from_secs(2));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! assert_eq!(backoff.delay(10), Duration::from_secs(30));
//! ```

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fmt, time::Duration};

/// Trait implemented by every backoff policy.
///
/// Policies are shared between concurrent redeliveries, so implementations
/// must not depend on call history.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Returns the delay for the given 1-based attempt.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Always returns a zero delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Returns `initial_delay` for the first attempt and `fixed_delay` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    initial_delay: Duration,
    fixed_delay: Duration,
}

impl FixedBackoff {
    pub fn new(initial_delay: Duration, fixed_delay: Duration) -> Self {
        Self {
            initial_delay,
            fixed_delay,
        }
    }

    /// Same delay for every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self::new(delay, delay)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        match normalize(attempt) {
            1 => self.initial_delay,
            _ => self.fixed_delay,
        }
    }
}

/// Exponential growth from `interval`, clamped to `[interval, max_interval]`.
///
/// Attempt 1 returns `initial_delay`, attempt 2 returns `interval`, and
/// attempt `n > 2` returns `interval * multiplier^(n-2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    interval: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl ExponentialBackoff {
    pub fn new(
        initial_delay: Duration,
        interval: Duration,
        multiplier: f64,
        max_interval: Duration,
    ) -> Self {
        Self {
            initial_delay,
            interval,
            multiplier,
            max_interval,
        }
    }

    fn scaled(&self, attempt: u32, factor: f64) -> Duration {
        match normalize(attempt) {
            1 => self.initial_delay,
            2 => self.interval,
            attempt => {
                let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
                let secs = self.interval.as_secs_f64() * self.multiplier.powi(exponent) * factor;
                let delay = if secs.is_finite() && secs >= 0.0 {
                    Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
                } else {
                    self.max_interval
                };

                delay.min(self.max_interval).max(self.interval)
            }
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.scaled(attempt, 1.0)
    }
}

/// [`ExponentialBackoff`] whose exponentiated value is scaled by a uniform
/// random factor in `[1, multiplier)` before clamping.
///
/// The random source is owned by the policy; build it with
/// [`with_seed`](ExponentialJitterBackoff::with_seed) for deterministic
/// sequences.
pub struct ExponentialJitterBackoff {
    exponential: ExponentialBackoff,
    rng: Mutex<StdRng>,
}

impl ExponentialJitterBackoff {
    pub fn new(
        initial_delay: Duration,
        interval: Duration,
        multiplier: f64,
        max_interval: Duration,
    ) -> Self {
        Self::with_rng(
            ExponentialBackoff::new(initial_delay, interval, multiplier, max_interval),
            StdRng::from_os_rng(),
        )
    }

    pub fn with_seed(
        initial_delay: Duration,
        interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        seed: u64,
    ) -> Self {
        Self::with_rng(
            ExponentialBackoff::new(initial_delay, interval, multiplier, max_interval),
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(exponential: ExponentialBackoff, rng: StdRng) -> Self {
        Self {
            exponential,
            rng: Mutex::new(rng),
        }
    }

    fn factor(&self) -> f64 {
        let multiplier = self.exponential.multiplier;
        if multiplier.is_nan() || multiplier <= 1.0 || multiplier.is_infinite() {
            return 1.0;
        }

        self.rng.lock().random_range(1.0..multiplier)
    }
}

impl fmt::Debug for ExponentialJitterBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialJitterBackoff")
            .field("exponential", &self.exponential)
            .finish_non_exhaustive()
    }
}

impl BackoffPolicy for ExponentialJitterBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if normalize(attempt) <= 2 {
            return self.exponential.delay(attempt);
        }

        self.exponential.scaled(attempt, self.factor())
    }
}

/// Explicit schedule indexed by `attempt - 1`; the last entry repeats once the
/// schedule is exhausted and an empty schedule always yields zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomBackoff {
    intervals: Vec<Duration>,
}

impl CustomBackoff {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }
}

impl BackoffPolicy for CustomBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let index = (normalize(attempt) - 1) as usize;

        self.intervals
            .get(index)
            .or_else(|| self.intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

fn normalize(attempt: u32) -> u32 {
    attempt.max(1)
}
