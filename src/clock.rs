//! Clock helpers shared by the wait timer model and the formatter.

use chrono::{DateTime, Local, TimeZone};

/// Read a clock in nanoseconds, 0 if the clock is unavailable.
pub fn get_clock_value(clock_id: libc::c_int) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Source of monotonic nanosecond timestamps.
pub trait MonotonicClock {
    fn now_ns(&self) -> u64;
}

/// CLOCK_MONOTONIC, the clock `bpf_ktime_get_ns()` reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMonotonic;

impl MonotonicClock for SystemMonotonic {
    fn now_ns(&self) -> u64 {
        get_clock_value(libc::CLOCK_MONOTONIC)
    }
}

/// A pair of monotonic and realtime readings taken together, used to turn
/// kernel timestamps into wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnchor {
    pub monotonic_ns: u64,
    pub realtime_ns: u64,
}

impl ClockAnchor {
    pub fn capture() -> Self {
        ClockAnchor {
            monotonic_ns: get_clock_value(libc::CLOCK_MONOTONIC),
            realtime_ns: get_clock_value(libc::CLOCK_REALTIME),
        }
    }

    /// Realtime nanoseconds corresponding to a monotonic timestamp.
    pub fn realtime_ns(&self, monotonic_ns: u64) -> u64 {
        if monotonic_ns >= self.monotonic_ns {
            self.realtime_ns.saturating_add(monotonic_ns - self.monotonic_ns)
        } else {
            self.realtime_ns.saturating_sub(self.monotonic_ns - monotonic_ns)
        }
    }

    pub fn wall_clock(&self, monotonic_ns: u64) -> DateTime<Local> {
        let ns = self.realtime_ns(monotonic_ns).min(i64::MAX as u64) as i64;
        Local.timestamp_nanos(ns)
    }
}
