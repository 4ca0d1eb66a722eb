//! Retry policy for delivery attempts.
//!
//! Delays follow decorrelated-jitter backoff: each step advances a random
//! "time" `t` by a uniform sample and the delay is the growth of
//! `2^t * tanh(sqrt(4t))` since the previous step, scaled so that the first
//! delay centres on the configured median. Later delays grow around
//! `median * 2^k` without the synchronised spikes of plain exponential
//! backoff.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Normalises the curve so the median first delay is roughly one unit.
const P_FACTOR: f64 = 1.4;

/// Bounded retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Median delay before the first retry.
    pub median_first_delay: Duration,
    /// Retries after the first attempt.
    pub retry_count: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(median_first_delay: Duration, retry_count: u32) -> Self {
        Self {
            median_first_delay,
            retry_count,
        }
    }

    /// A zero count or a zero delay turns retries off.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.retry_count == 0 || self.median_first_delay.is_zero()
    }

    /// Total attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        if self.is_disabled() {
            1
        } else {
            self.retry_count.saturating_add(1)
        }
    }

    /// A fresh delay sequence seeded from the thread RNG.
    #[must_use]
    pub fn delays(&self) -> Backoff {
        self.delays_with(StdRng::from_rng(&mut rand::rng()))
    }

    /// A reproducible delay sequence.
    #[must_use]
    pub fn seeded(&self, seed: u64) -> Backoff {
        self.delays_with(StdRng::seed_from_u64(seed))
    }

    fn delays_with(&self, rng: StdRng) -> Backoff {
        Backoff {
            rng,
            median_secs: self.median_first_delay.as_secs_f64(),
            remaining: if self.is_disabled() {
                0
            } else {
                self.retry_count
            },
            t: 0.0,
            previous: 0.0,
        }
    }
}

/// The delays of one message's retry loop, consumed one per retry.
#[derive(Debug, Clone)]
pub struct Backoff {
    rng: StdRng,
    median_secs: f64,
    remaining: u32,
    t: f64,
    previous: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        self.t += self.rng.random::<f64>();
        let next = self.t.exp2() * (4.0 * self.t).sqrt().tanh();
        let delay = (next - self.previous) / P_FACTOR * self.median_secs;
        self.previous = next;

        Some(Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(Duration::MAX))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Backoff {}
