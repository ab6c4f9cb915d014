/*!
 # Software wall clock

 There is no real-time clock on the fixture. Wall time is seeded once from the
 first accepted configuration record and then advanced from a free-running
 microsecond timer. Sub-second remainders are carried between ticks so no
 drift builds up from truncation.
*/

use std::time::Instant;
use tracing::{debug, info, trace, warn};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Free-running microsecond timer
pub trait MonotonicClock {
    fn now_micros(&self) -> u64;
}

/// Monotonic timer backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemMonotonic {
    start: Instant,
}

impl SystemMonotonic {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemMonotonic {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Wall time estimate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    /// Seconds since the Unix epoch; never decreases
    pub epoch_seconds: i64,
    /// Sub-second carry, always below one million
    pub residual_micros: u32,
}

/// Converts monotonic timer readings into drift-free epoch seconds
#[derive(Debug, Default)]
pub struct ClockKeeper {
    state: ClockState,
    last_sample_micros: Option<u64>,
    seeded: bool,
}

impl ClockKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.state.epoch_seconds
    }

    /// Whether wall time has been seeded from a configuration record
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Seeds wall time. Only the first call has any effect.
    ///
    /// Returns `true` if this call seeded the clock.
    pub fn seed(&mut self, epoch_seconds: i64) -> bool {
        if self.seeded {
            debug!("Clock already seeded, ignoring timestamp {}", epoch_seconds);
            return false;
        }
        if epoch_seconds < self.state.epoch_seconds {
            warn!(
                "Seed {} is behind uptime count {}, keeping the latter",
                epoch_seconds, self.state.epoch_seconds
            );
        }
        self.state.epoch_seconds = self.state.epoch_seconds.max(epoch_seconds);
        self.seeded = true;
        info!("Clock seeded at {}", self.state.epoch_seconds);
        true
    }

    /// Advances wall time from a monotonic reading.
    ///
    /// The first reading only establishes the baseline. A reading below the
    /// previous one (timer restart) re-baselines without advancing.
    /// Returns the number of whole seconds added.
    pub fn tick(&mut self, now_micros: u64) -> u64 {
        let Some(last) = self.last_sample_micros.replace(now_micros) else {
            trace!("Clock baseline at {} us", now_micros);
            return 0;
        };
        let Some(delta) = now_micros.checked_sub(last) else {
            warn!(
                "Monotonic timer went backwards ({} -> {} us), re-baselining",
                last, now_micros
            );
            return 0;
        };

        let total = u64::from(self.state.residual_micros) + delta;
        let seconds = total / MICROS_PER_SECOND;
        // Remainder is below one million
        self.state.residual_micros = (total % MICROS_PER_SECOND) as u32;
        self.state.epoch_seconds = self
            .state
            .epoch_seconds
            .saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX));
        seconds
    }
}

/// Shifts UTC seconds by a whole-hour offset, saturating at the `i64` limits
pub fn local_seconds(epoch_seconds: i64, timezone_offset_hours: i8) -> i64 {
    epoch_seconds.saturating_add(i64::from(timezone_offset_hours) * 3600)
}

/// Formats wall time as local `HH:MM`.
///
/// The offset is applied as whole hours. Daylight saving is never added on top.
pub fn to_local_time_string(epoch_seconds: i64, timezone_offset_hours: i8) -> String {
    let local = local_seconds(epoch_seconds, timezone_offset_hours);
    let hours = local.div_euclid(3600).rem_euclid(24);
    let minutes = local.div_euclid(60).rem_euclid(60);
    format!("{:02}:{:02}", hours, minutes)
}
