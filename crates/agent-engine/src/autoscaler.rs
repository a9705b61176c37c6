//! Pool autoscaler.
//!
//! One ticker samples the pressure signals and decides growth or shrink.
//! Growth needs demand (`hits >= current_workers`, meaning the controller
//! had more work than the pool absorbed) and CPU headroom; shrink needs a
//! sustained idle streak, which gives the pool hysteresis against single
//! quiet ticks. The per-tick decision is a pure function so the laws are
//! testable without a runtime.

use std::sync::Arc;
use std::time::Duration;

use fabric_agent_core::metrics::HostSampler;
use fabric_agent_core::ratelimit::RateLimiter;
use fabric_agent_core::signals::{PressureSignals, PressureSnapshot};

use crate::api::ScaleConfig;
use crate::pool::WorkerPool;

/// What one tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Plan {
    pub(crate) spawn: usize,
    pub(crate) reap: usize,
    /// Reset the idle streak after reaping so the next shrink needs a full
    /// streak again.
    pub(crate) reset_streak: bool,
}

/// Decide the tick's action from the sampled pressure state.
///
/// `idle_streak` is the streak value after this tick's idle accounting.
pub(crate) fn plan(
    snap: &PressureSnapshot,
    current: usize,
    cpu_util_pct: f32,
    idle_streak: u32,
    cfg: &ScaleConfig,
    min_workers: usize,
    soft_cap: usize,
) -> Plan {
    // A dead pool is refilled to the floor immediately.
    if current == 0 {
        return Plan {
            spawn: min_workers.min(soft_cap),
            reap: 0,
            reset_streak: false,
        };
    }

    let mut decided = Plan::default();

    if current < min_workers {
        decided.spawn = min_workers - current;
    }

    let demand = snap.hits >= (current as u64).max(1);
    if demand && cpu_util_pct < cfg.target_cpu_util_pct {
        let headroom = soft_cap.saturating_sub(current + decided.spawn);
        decided.spawn += cfg.spawn_step.min(headroom);
    }

    if idle_streak >= cfg.idle_reap_ticks {
        decided.reap = cfg.reap_step.min(current.saturating_sub(min_workers));
        decided.reset_streak = true;
    }

    decided
}

/// Run the autoscaler loop until the stop closure returns true. `spawn_one`
/// must add one worker to the pool and report whether it did.
pub(crate) async fn run_autoscaler(
    cfg: ScaleConfig,
    pool: Arc<WorkerPool>,
    signals: Arc<PressureSignals>,
    sampler: Arc<HostSampler>,
    limiter: Arc<RateLimiter>,
    spawn_one: impl Fn() -> bool,
    should_stop: impl Fn() -> bool,
) {
    let tick = cfg.tick.max(Duration::from_millis(200));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if should_stop() {
            return;
        }

        let pruned = pool.prune();
        if pruned > 0 && limiter.check("scale:prune") {
            tracing::warn!(pruned, "removed dead workers from the pool");
        }

        let current = pool.count();
        let snap = signals.snapshot_and_reset();
        let idle_streak = if snap.hits == 0 && snap.inflight == 0 {
            signals.bump_idle_streak()
        } else {
            signals.reset_idle_streak();
            0
        };
        let cpu_util_pct = sampler.cpu_util_pct();

        let decided = plan(
            &snap,
            current,
            cpu_util_pct,
            idle_streak,
            &cfg,
            pool.min_workers(),
            pool.soft_cap(),
        );

        for _ in 0..decided.spawn {
            if !spawn_one() {
                break;
            }
        }
        for _ in 0..decided.reap {
            if let Some(id) = pool.reap_highest() {
                tracing::debug!(worker = id, "reaped idle worker");
            }
        }
        if decided.reset_streak {
            signals.reset_idle_streak();
        }

        if decided.spawn > 0 || decided.reap > 0 {
            tracing::debug!(
                hits = snap.hits,
                misses = snap.misses,
                inflight = snap.inflight,
                cpu_util_pct,
                workers = pool.count(),
                "pool resized"
            );
        }
    }
}
