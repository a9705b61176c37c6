//! Pressure signals shared between workers, the dispatcher and the
//! autoscaler.
//!
//! All counters live in one small record behind a single mutex so the
//! per-tick snapshot cannot observe a torn state. `hits` and `misses` reset
//! on snapshot; `inflight` is a gauge bracketing op execution; `idle_streak`
//! counts consecutive quiet autoscaler ticks.

use std::sync::Mutex;

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    inflight: i64,
    idle_streak: u32,
}

/// Point-in-time view returned by [`PressureSignals::snapshot_and_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureSnapshot {
    /// Tasks leased since the previous snapshot.
    pub hits: u64,
    /// Empty polls since the previous snapshot.
    pub misses: u64,
    /// Ops currently executing.
    pub inflight: i64,
}

#[derive(Debug, Default)]
pub struct PressureSignals {
    inner: Mutex<Counters>,
}

impl PressureSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.lock().hits += 1;
    }

    pub fn miss(&self) {
        self.lock().misses += 1;
    }

    pub fn op_started(&self) {
        self.lock().inflight += 1;
    }

    pub fn op_finished(&self) {
        let mut c = self.lock();
        c.inflight = (c.inflight - 1).max(0);
    }

    pub fn inflight(&self) -> i64 {
        self.lock().inflight
    }

    /// Atomically read the tick counters, resetting `hits` and `misses`.
    pub fn snapshot_and_reset(&self) -> PressureSnapshot {
        let mut c = self.lock();
        let snap = PressureSnapshot {
            hits: c.hits,
            misses: c.misses,
            inflight: c.inflight,
        };
        c.hits = 0;
        c.misses = 0;
        snap
    }

    /// Increment the idle streak and return the new value.
    pub fn bump_idle_streak(&self) -> u32 {
        let mut c = self.lock();
        c.idle_streak += 1;
        c.idle_streak
    }

    pub fn reset_idle_streak(&self) {
        self.lock().idle_streak = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.inner.lock().expect("pressure signals lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_hits_and_misses_but_not_inflight() {
        let signals = PressureSignals::new();
        signals.hit();
        signals.hit();
        signals.miss();
        signals.op_started();

        let snap = signals.snapshot_and_reset();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.inflight, 1);

        let snap = signals.snapshot_and_reset();
        assert_eq!(snap.hits, 0);
        assert_eq!(snap.misses, 0);
        assert_eq!(snap.inflight, 1);
    }

    #[test]
    fn inflight_never_goes_negative() {
        let signals = PressureSignals::new();
        signals.op_finished();
        assert_eq!(signals.inflight(), 0);
    }

    #[test]
    fn idle_streak_accumulates_and_resets() {
        let signals = PressureSignals::new();
        assert_eq!(signals.bump_idle_streak(), 1);
        assert_eq!(signals.bump_idle_streak(), 2);
        signals.reset_idle_streak();
        assert_eq!(signals.bump_idle_streak(), 1);
    }
}
