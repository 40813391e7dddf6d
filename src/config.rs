//! Engine configuration and platform default periods.

use std::time::Duration;

use crate::engine::HeartbeatError;

/// How long a server announcement stays valid on the controller before its
/// record expires. The forced re-announce cadence is derived from this.
pub const SERVER_ANNOUNCE_TTL: Duration = Duration::from_secs(600);

/// How often the engine asks the driver whether the advertised spec changed.
pub const HEARTBEAT_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// Window after which missing announcements are considered a degraded state.
/// Deliberately longer than the announce cadence so a healthy engine never
/// trips it.
pub const SERVER_KEEPALIVE_TTL: Duration = Duration::from_secs(900);

/// Nominal pause after a failed fallback upsert before the next attempt.
pub const FALLBACK_BACKOFF: Duration = Duration::from_secs(60);

/// Per-attempt heartbeat callback. Invoked synchronously from the engine
/// worker with `Ok(())` on success or one of the [`HeartbeatError`] sentinels
/// on failure, at most once per worker iteration.
pub type HeartbeatCallback = Box<dyn Fn(Result<(), HeartbeatError>) + Send>;

/// Configuration for a [`crate::engine::Heartbeat`].
///
/// Zero durations are replaced with the platform defaults above when the
/// engine is constructed, so `..Default::default()` composes with partial
/// overrides.
pub struct HeartbeatConfig {
    /// Period of forced re-announce ticks (heartbeat even if unchanged).
    ///
    /// Default: 2/3 of [`SERVER_ANNOUNCE_TTL`]. With the seventh jitter
    /// applied by the scheduler the realized cadence averages ~6/7 of this.
    pub announce_interval: Duration,
    /// Period of change-detection ticks.
    ///
    /// Default: [`HEARTBEAT_CHECK_PERIOD`]
    pub poll_interval: Duration,
    /// Nominal backoff applied after a failed fallback upsert.
    ///
    /// Default: [`FALLBACK_BACKOFF`]
    pub fallback_backoff: Duration,
    /// Period of degraded-state emission while no stream sender is available.
    ///
    /// Default: [`SERVER_KEEPALIVE_TTL`]
    pub degraded_check_interval: Duration,
    /// Per-attempt heartbeat callback (optional).
    pub on_heartbeat: Option<HeartbeatCallback>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::ZERO,
            poll_interval: Duration::ZERO,
            fallback_backoff: Duration::ZERO,
            degraded_check_interval: Duration::ZERO,
            on_heartbeat: None,
        }
    }
}

impl HeartbeatConfig {
    /// Replace unset (zero) durations with the platform defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.announce_interval.is_zero() {
            self.announce_interval = 2 * SERVER_ANNOUNCE_TTL / 3;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = HEARTBEAT_CHECK_PERIOD;
        }
        if self.fallback_backoff.is_zero() {
            self.fallback_backoff = FALLBACK_BACKOFF;
        }
        if self.degraded_check_interval.is_zero() {
            self.degraded_check_interval = SERVER_KEEPALIVE_TTL;
        }
        self
    }
}

impl std::fmt::Debug for HeartbeatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatConfig")
            .field("announce_interval", &self.announce_interval)
            .field("poll_interval", &self.poll_interval)
            .field("fallback_backoff", &self.fallback_backoff)
            .field("degraded_check_interval", &self.degraded_check_interval)
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .finish()
    }
}
