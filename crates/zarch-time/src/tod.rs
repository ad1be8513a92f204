use serde::{Deserialize, Serialize};

/// TOD clock units per microsecond (bit 51 of the clock is the microsecond bit).
pub const TOD_UNITS_PER_US: u64 = 4096;

pub fn ns_to_tod(ns: u64) -> u64 {
    ((ns as u128) * (TOD_UNITS_PER_US as u128) / 1_000u128) as u64
}

/// Converts TOD units to nanoseconds, rounding up so a deadline computed from it is never early.
pub fn tod_to_ns(tod: u64) -> u64 {
    let numer = (tod as u128) * 1_000u128;
    let denom = TOD_UNITS_PER_US as u128;
    ((numer + denom - 1) / denom).min(u64::MAX as u128) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TodClockConfig {
    /// TOD value at guest time zero.
    pub initial_tod: u64,
}

impl Default for TodClockConfig {
    fn default() -> Self {
        Self { initial_tod: 0 }
    }
}

/// The machine-wide time-of-day clock.
///
/// Values returned by [`TodClock::store`] are strictly increasing: when two stores land in the
/// same TOD unit the later one is bumped past the earlier one. A single instance is shared by all
/// CPUs of a configuration, so callers serialize access to it.
#[derive(Debug, Clone)]
pub struct TodClock {
    base_tod: u64,
    base_guest_ns: u64,
    last_stored: Option<u64>,
}

impl TodClock {
    pub fn new(config: TodClockConfig) -> Self {
        Self {
            base_tod: config.initial_tod,
            base_guest_ns: 0,
            last_stored: None,
        }
    }

    /// Current clock value without the uniqueness adjustment.
    pub fn read(&self, guest_now_ns: u64) -> u64 {
        let delta_ns = guest_now_ns.saturating_sub(self.base_guest_ns);
        self.base_tod.wrapping_add(ns_to_tod(delta_ns))
    }

    /// Clock value as returned by STORE CLOCK: unique and monotonic across all callers.
    pub fn store(&mut self, guest_now_ns: u64) -> u64 {
        let mut value = self.read(guest_now_ns);
        if let Some(last) = self.last_stored {
            if value <= last {
                value = last.wrapping_add(1);
            }
        }
        self.last_stored = Some(value);
        value
    }

    /// SET CLOCK: the clock continues counting from `value`.
    pub fn set(&mut self, guest_now_ns: u64, value: u64) {
        self.base_tod = value;
        self.base_guest_ns = guest_now_ns;
        self.last_stored = None;
    }

    /// Guest time at which the clock reaches `target`, or `None` when it already has.
    pub fn guest_ns_for_tod(&self, guest_now_ns: u64, target: u64) -> Option<u64> {
        let now = self.read(guest_now_ns);
        if target <= now {
            return None;
        }
        Some(guest_now_ns.saturating_add(tod_to_ns(target - now)))
    }
}

/// Per-CPU timer, decremented at the TOD rate and stored as an absolute TOD deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimer {
    deadline_tod: u64,
}

impl CpuTimer {
    /// SET CPU TIMER.
    pub fn set(&mut self, now_tod: u64, value: i64) {
        self.deadline_tod = now_tod.wrapping_add(value as u64);
    }

    /// STORE CPU TIMER: remaining value, negative once the timer has expired.
    pub fn remaining(&self, now_tod: u64) -> i64 {
        self.deadline_tod.wrapping_sub(now_tod) as i64
    }

    pub fn expired(&self, now_tod: u64) -> bool {
        self.remaining(now_tod) < 0
    }
}
