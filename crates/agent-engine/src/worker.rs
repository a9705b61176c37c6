//! The per-worker loop: lease, execute, post, repeat.
//!
//! Stop (global or per-worker) is observed only at the lease boundary, so a
//! running op always finishes and its result always posts. Exactly one
//! result post is attempted per task; a failed post is logged rate-limited
//! and the loop moves on — the controller owns retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use serde_json::Value;
use tokio::sync::watch;

use fabric_agent_core::ratelimit::RateLimiter;
use fabric_agent_core::signals::PressureSignals;
use fabric_agent_ops::registry::Registry;

use crate::api::AgentInner;
use crate::controller::{ControllerClient, Task, TaskResult};

const BACKOFF_JITTER_MS: u64 = 15;

pub(crate) struct WorkerShared {
    pub(crate) controller: Arc<ControllerClient>,
    pub(crate) registry: Registry,
    pub(crate) signals: Arc<PressureSignals>,
    pub(crate) inner: Arc<AgentInner>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) lease_idle: Duration,
    pub(crate) error_backoff: Duration,
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..=BACKOFF_JITTER_MS))
}

pub(crate) async fn run_worker(
    id: u64,
    stop_rx: watch::Receiver<bool>,
    shared: Arc<WorkerShared>,
) {
    tracing::debug!(worker = id, "worker started");

    loop {
        if shared.inner.should_stop() || *stop_rx.borrow() {
            break;
        }

        match shared.controller.lease().await {
            Ok(tasks) if !tasks.is_empty() => {
                for task in tasks {
                    shared.signals.hit();
                    handle_task(&shared, id, &task).await;
                }
            }
            Ok(_) => {
                shared.signals.miss();
                tokio::time::sleep(shared.lease_idle + jitter()).await;
            }
            Err(err) => {
                if shared.limiter.check("lease") {
                    tracing::warn!(worker = id, %err, "lease failed");
                }
                tokio::time::sleep(shared.error_backoff + jitter()).await;
            }
        }
    }

    tracing::debug!(worker = id, "worker stopped");
}

async fn handle_task(shared: &WorkerShared, worker: u64, task: &Task) {
    let outcome = shared
        .registry
        .execute(&task.op, task.payload.as_ref(), &shared.signals)
        .await;
    let duration_ms = outcome.elapsed.as_secs_f64() * 1000.0;

    let result = TaskResult {
        ok: outcome.ok,
        result: outcome.result,
        error: outcome
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok())
            .unwrap_or(Value::Null),
    };

    if outcome.ok {
        tracing::info!(
            worker,
            job = %task.job_id,
            op = %task.op,
            ms = duration_ms,
            "op ok"
        );
    } else if shared.limiter.check("exec") {
        tracing::warn!(
            worker,
            job = %task.job_id,
            op = %task.op,
            ms = duration_ms,
            error = %result.error,
            "op failed"
        );
    }

    if let Err(err) = shared.controller.post_result(task, &result).await {
        if shared.limiter.check("result") {
            tracing::warn!(worker, job = %task.job_id, %err, "post result failed");
        }
    }
}
