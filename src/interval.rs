// SPDX-License-Identifier: MIT
//! Jittered periodic tick source.
//!
//! [`Interval`] is a cadence, not a queue: ticks that elapse while the worker
//! is busy coalesce into a single fire, and every re-arm is measured from the
//! moment the previous tick was observed. Agent fleets stay desynchronized
//! because the first tick and every subsequent period carry uniform jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Jitter applied to each period between ticks.
pub type JitterFn = fn(Duration) -> Duration;

/// Subtract a uniform random amount of up to 1/7 of `d`.
///
/// The result lands in `[6d/7, d]`, so a periodic using it averages ~6/7 of
/// the nominal period and never bunches across a fleet.
pub fn seventh_jitter(d: Duration) -> Duration {
    jitter_down(d, 7)
}

/// Subtract a uniform random amount of up to half of `d`.
///
/// Used for first-tick delays so freshly started agents spread their initial
/// announcements over `[d/2, d]`.
pub fn half_jitter(d: Duration) -> Duration {
    jitter_down(d, 2)
}

fn jitter_down(d: Duration, denominator: u64) -> Duration {
    let nanos = d.as_nanos() as u64;
    let span = nanos / denominator;
    if span == 0 {
        return d;
    }
    let cut = rand::thread_rng().gen_range(0..span);
    Duration::from_nanos(nanos - cut)
}

/// Configuration for an [`Interval`].
pub struct IntervalConfig {
    /// Delay before the very first tick. `None` means one full (jittered)
    /// period.
    pub first_duration: Option<Duration>,
    /// Nominal period between subsequent ticks.
    pub duration: Duration,
    /// Jitter applied to each period after the first. `None` fires exactly on
    /// the nominal period.
    pub jitter: Option<JitterFn>,
}

/// A periodic tick source with per-period jitter and coalescing semantics.
pub struct Interval {
    duration: Duration,
    jitter: Option<JitterFn>,
    deadline: Instant,
}

impl Interval {
    pub fn new(cfg: IntervalConfig) -> Self {
        let mut interval = Self {
            duration: cfg.duration,
            jitter: cfg.jitter,
            deadline: Instant::now(),
        };
        match cfg.first_duration {
            Some(first) => interval.deadline = Instant::now() + first,
            None => interval.rearm(),
        }
        interval
    }

    /// Wait for the next tick.
    ///
    /// Cancel safe: dropping the returned future before it completes leaves
    /// the pending deadline untouched. Once it completes the interval re-arms
    /// a full (jittered) period from now, so a tick observed late does not
    /// cause a burst of catch-up fires.
    pub async fn tick(&mut self) {
        tokio::time::sleep_until(self.deadline).await;
        self.rearm();
    }

    /// Discard any pending tick and push the next one out by a full
    /// (jittered) period from now.
    pub fn reset(&mut self) {
        self.rearm();
    }

    fn rearm(&mut self) {
        let period = match self.jitter {
            Some(jitter) => jitter(self.duration),
            None => self.duration,
        };
        self.deadline = Instant::now() + period;
    }
}

impl std::fmt::Debug for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interval")
            .field("duration", &self.duration)
            .field("deadline", &self.deadline)
            .finish()
    }
}
