//! Test oracle for the wait start/end hooks.
//!
//! `waittrace.bpf.c` is what runs in production. [`WaitTimer`] restates its
//! pairing, noise floor and correlation rules on the host, with the clock and
//! the cursor table injected, so those rules are pinned down by tests that do
//! not need a kernel. It is compiled for tests only; a change to the BPF
//! program's rules must be mirrored here.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::clock::MonotonicClock;
use crate::config::DEFAULT_NOISE_FLOOR_NS;
use crate::correlator::CursorResolver;
use crate::record::WaitEvent;

const PENDING_SHARDS: usize = 16;

/// A wait that has started but not ended yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWait {
    pub start_ns: u64,
    pub wait_class_code: u32,
}

/// Per-thread pending waits, sharded by tid so hook hits on different
/// threads rarely contend.
struct PendingWaits {
    shards: [Mutex<HashMap<u32, PendingWait>>; PENDING_SHARDS],
}

impl PendingWaits {
    fn new() -> Self {
        PendingWaits {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn shard(&self, tid: u32) -> std::sync::MutexGuard<'_, HashMap<u32, PendingWait>> {
        self.shards[tid as usize % PENDING_SHARDS]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, tid: u32, pending: PendingWait) {
        self.shard(tid).insert(tid, pending);
    }

    fn take(&self, tid: u32) -> Option<PendingWait> {
        self.shard(tid).remove(&tid)
    }

    fn get(&self, tid: u32) -> Option<PendingWait> {
        self.shard(tid).get(&tid).copied()
    }

    fn len(&self) -> usize {
        (0..PENDING_SHARDS)
            .map(|i| self.shard(i as u32).len())
            .sum()
    }

    fn clear(&self) {
        for i in 0..PENDING_SHARDS {
            self.shard(i as u32).clear();
        }
    }
}

/// Counters matching the `wait_stats` map of the BPF program.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WaitCounts {
    pub emitted: u64,
    pub suppressed: u64,
    pub unmatched: u64,
}

pub struct WaitTimer<C, R> {
    clock: C,
    cursors: R,
    noise_floor_ns: u64,
    pending: PendingWaits,
    counts: Mutex<WaitCounts>,
}

impl<C, R> WaitTimer<C, R>
where
    C: MonotonicClock,
    R: CursorResolver,
{
    pub fn new(clock: C, cursors: R) -> Self {
        Self::with_noise_floor(clock, cursors, DEFAULT_NOISE_FLOOR_NS)
    }

    pub fn with_noise_floor(clock: C, cursors: R, noise_floor_ns: u64) -> Self {
        WaitTimer {
            clock,
            cursors,
            noise_floor_ns,
            pending: PendingWaits::new(),
            counts: Mutex::new(WaitCounts::default()),
        }
    }

    /// A thread started waiting. Replaces any start already recorded for it.
    pub fn wait_start(&self, tid: u32, wait_class_code: u32) {
        self.pending.insert(
            tid,
            PendingWait {
                start_ns: self.clock.now_ns(),
                wait_class_code,
            },
        );
    }

    /// A thread stopped waiting. Returns the event to transport, if any.
    ///
    /// The pending entry for `tid` is gone afterwards whether or not an
    /// event is produced.
    pub fn wait_end(&self, tid: u32, pid: u32) -> Option<WaitEvent> {
        let Some(pending) = self.pending.take(tid) else {
            self.bump(|counts| counts.unmatched += 1);
            return None;
        };

        let end_ns = self.clock.now_ns();
        let duration_ns = end_ns.wrapping_sub(pending.start_ns);
        if duration_ns < self.noise_floor_ns {
            self.bump(|counts| counts.suppressed += 1);
            return None;
        }

        self.bump(|counts| counts.emitted += 1);
        Some(WaitEvent {
            timestamp_ns: end_ns,
            pid,
            tid,
            cursor_id: self.cursors.resolve(pid).unwrap_or(0),
            wait_class_code: pending.wait_class_code,
            duration_ns,
        })
    }

    pub fn pending(&self, tid: u32) -> Option<PendingWait> {
        self.pending.get(tid)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn counts(&self) -> WaitCounts {
        *self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget all in-flight waits, as happens when a session ends.
    pub fn reset(&self) {
        self.pending.clear();
    }

    fn bump(&self, f: impl FnOnce(&mut WaitCounts)) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut *counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::NoCursors;
    use crate::format::format_line;
    use chrono::Local;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn set(&self, ns: u64) {
            self.0.store(ns, Ordering::SeqCst);
        }
    }

    impl MonotonicClock for ManualClock {
        fn now_ns(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    type TestTimer = WaitTimer<ManualClock, HashMap<u32, u64>>;

    fn timer_with(cursors: HashMap<u32, u64>) -> (ManualClock, TestTimer) {
        let clock = ManualClock::default();
        let timer = WaitTimer::new(clock.clone(), cursors);
        (clock, timer)
    }

    #[test]
    fn test_cursor_scenario() {
        let (clock, timer) = timer_with(HashMap::from([(100, 42)]));
        clock.set(0);
        timer.wait_start(5, 0x0500_0001);
        clock.set(5000);
        let event = timer.wait_end(5, 100).unwrap();

        assert_eq!(event.cursor_id, 42);
        assert_eq!(event.duration_ns, 5000);
        assert_eq!(event.timestamp_ns, 5000);
        assert_eq!(event.pid, 100);
        assert_eq!(event.tid, 5);

        let line = format_line(&event, &Local::now());
        assert!(
            line.starts_with("WAIT #42: nam='DataFileRead' ela=5 us tim="),
            "{line}"
        );
    }

    #[test]
    fn test_duration_is_exact() {
        let (clock, timer) = timer_with(HashMap::new());
        for (start, end) in [(0u64, 1000u64), (123_456, 987_654_321), (7, 1_000_007)] {
            clock.set(start);
            timer.wait_start(9, 1);
            clock.set(end);
            let event = timer.wait_end(9, 9).unwrap();
            assert_eq!(event.duration_ns, end - start);
            assert_eq!(event.timestamp_ns, end);
        }
    }

    #[test]
    fn test_short_wait_is_suppressed_and_cleared() {
        let (clock, timer) = timer_with(HashMap::new());
        clock.set(1_000);
        timer.wait_start(5, 1);
        clock.set(1_999);
        assert_eq!(timer.wait_end(5, 100), None);
        assert_eq!(timer.pending(5), None);

        // A later pair on the same thread is measured on its own.
        clock.set(10_000);
        timer.wait_start(5, 2);
        clock.set(13_000);
        let event = timer.wait_end(5, 100).unwrap();
        assert_eq!(event.duration_ns, 3_000);
        assert_eq!(event.wait_class_code, 2);

        assert_eq!(
            timer.counts(),
            WaitCounts {
                emitted: 1,
                suppressed: 1,
                unmatched: 0
            }
        );
    }

    #[test]
    fn test_zero_duration_is_suppressed() {
        let (clock, timer) = timer_with(HashMap::new());
        clock.set(500);
        timer.wait_start(1, 1);
        assert_eq!(timer.wait_end(1, 1), None);
    }

    #[test]
    fn test_noise_floor_boundary() {
        let (clock, timer) = timer_with(HashMap::new());
        clock.set(0);
        timer.wait_start(1, 1);
        clock.set(DEFAULT_NOISE_FLOOR_NS);
        assert!(timer.wait_end(1, 1).is_some());
    }

    #[test]
    fn test_unmatched_end_is_ignored() {
        let (_clock, timer) = timer_with(HashMap::new());
        assert_eq!(timer.wait_end(77, 100), None);
        assert_eq!(timer.counts().unmatched, 1);
        assert_eq!(timer.pending_len(), 0);
    }

    #[test]
    fn test_second_start_wins() {
        let (clock, timer) = timer_with(HashMap::new());
        clock.set(1_000);
        timer.wait_start(5, 0x0400_0001);
        clock.set(4_000);
        timer.wait_start(5, 0x0500_0001);
        clock.set(10_000);
        let event = timer.wait_end(5, 100).unwrap();
        assert_eq!(event.duration_ns, 6_000);
        assert_eq!(event.wait_class_code, 0x0500_0001);
    }

    #[test]
    fn test_unmapped_pid_has_no_cursor() {
        let clock = ManualClock::default();
        let timer = WaitTimer::new(clock.clone(), NoCursors);
        timer.wait_start(3, 1);
        clock.set(2_000);
        let event = timer.wait_end(3, 300).unwrap();
        assert_eq!(event.cursor_id, 0);
        assert!(!event.has_cursor());
    }

    #[test]
    fn test_threads_are_independent() {
        let (clock, timer) = timer_with(HashMap::from([(100, 1)]));
        clock.set(0);
        timer.wait_start(1, 1);
        clock.set(1_000);
        timer.wait_start(2, 2);
        assert_eq!(timer.pending_len(), 2);

        clock.set(5_000);
        let second = timer.wait_end(2, 100).unwrap();
        assert_eq!(second.duration_ns, 4_000);
        assert_eq!(timer.pending(1).unwrap().start_ns, 0);

        clock.set(9_000);
        let first = timer.wait_end(1, 100).unwrap();
        assert_eq!(first.duration_ns, 9_000);
    }

    #[test]
    fn test_reset_drops_pending() {
        let (_clock, timer) = timer_with(HashMap::new());
        for tid in 0..40 {
            timer.wait_start(tid, 0);
        }
        assert_eq!(timer.pending_len(), 40);
        timer.reset();
        assert_eq!(timer.pending_len(), 0);
        assert_eq!(timer.wait_end(3, 3), None);
    }

    #[test]
    fn test_concurrent_threads() {
        let clock = ManualClock::default();
        let timer = Arc::new(WaitTimer::new(clock.clone(), NoCursors));
        clock.set(0);
        let handles: Vec<_> = (0..8u32)
            .map(|tid| {
                let timer = timer.clone();
                std::thread::spawn(move || timer.wait_start(tid, tid))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        clock.set(2_000);
        let handles: Vec<_> = (0..8u32)
            .map(|tid| {
                let timer = timer.clone();
                std::thread::spawn(move || timer.wait_end(tid, 1))
            })
            .collect();
        let events: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(events.len(), 8);
        assert_eq!(timer.pending_len(), 0);
        assert!(events
            .iter()
            .all(|e| e.duration_ns == 2_000 && e.wait_class_code == e.tid));
    }
}
