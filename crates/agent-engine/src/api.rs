//! Public API types for the in-process fabric agent.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::{Map, Value};

use fabric_agent_core::profile::WorkerProfile;
use fabric_agent_ops::registry::TaskFilter;

/// Controller protocol dialect this agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Legacy single-task dialect: register/heartbeat/`GET /task`/`POST
    /// /result` under a discovered prefix.
    Legacy,
    /// Lease-bundle dialect: `POST /v1/leases` / `POST /v1/results`.
    Bundle,
}

/// Autoscaler tunables.
#[derive(Debug, Clone)]
pub struct ScaleConfig {
    /// CPU utilization (percent) above which the pool stops growing.
    pub target_cpu_util_pct: f32,
    /// Tick period.
    pub tick: Duration,
    /// Consecutive idle ticks before one reap.
    pub idle_reap_ticks: u32,
    /// Workers spawned per grow decision.
    pub spawn_step: usize,
    /// Workers reaped per shrink decision.
    pub reap_step: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            target_cpu_util_pct: 80.0,
            tick: Duration::from_secs(1),
            idle_reap_ticks: 6,
            spawn_step: 1,
            reap_step: 1,
        }
    }
}

/// Configuration for the in-process agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller base URL (e.g. `http://127.0.0.1:8080`).
    pub controller_url: Url,
    /// Protocol dialect.
    pub dialect: Dialect,
    /// Endpoint prefix candidates for the legacy dialect.
    pub api_prefix: String,
    /// Agent identity reported to the controller.
    pub agent_name: String,
    /// Advisory tags reported on register/lease.
    pub labels: Map<String, Value>,
    /// `TASKS` gating applied to the op allow-list.
    pub task_filter: TaskFilter,
    /// Host capacity profile built at startup.
    pub profile: WorkerProfile,
    /// Heartbeat period (legacy dialect only).
    pub heartbeat: Duration,
    /// Long-poll budget passed on lease requests, in milliseconds.
    pub wait_ms: u64,
    /// Maximum tasks per lease bundle (bundle dialect only).
    pub max_tasks: u32,
    /// Sleep after an empty poll.
    pub lease_idle: Duration,
    /// Sleep after a lease transport failure.
    pub error_backoff: Duration,
    /// Total HTTP timeout for controller calls.
    pub http_timeout: Duration,
    /// Window for rate-limited error logs, per key.
    pub error_log_every: Duration,
    /// Bound on waiting for in-flight ops to drain at shutdown.
    pub shutdown_grace: Duration,
    /// Autoscaler tunables.
    pub scale: ScaleConfig,
    /// Default model path for accelerator ops (`TPU_MODEL_PATH`).
    pub default_model_path: Option<String>,
}

impl AgentConfig {
    /// Default lease long-poll budget.
    pub const DEFAULT_WAIT_MS: u64 = 2_000;
    /// Default sleep after an empty poll.
    pub const DEFAULT_LEASE_IDLE: Duration = Duration::from_millis(50);
    /// Default sleep after a lease failure.
    pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);
    /// Default heartbeat period.
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(3);
    /// Default per-key window for rate-limited error logs.
    pub const DEFAULT_ERROR_LOG_EVERY: Duration = Duration::from_secs(10);
    /// Default bound on the shutdown drain.
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
    /// Minimum autoscaler tick.
    pub const MIN_SCALE_TICK: Duration = Duration::from_millis(200);
}

/// Unrecoverable startup failures surfaced to the binary for exit-code
/// mapping.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// `TASKS` gating left nothing to serve.
    #[error("no ops enabled; check TASKS")]
    NoOpsEnabled,
}

pub(crate) struct AgentInner {
    stop_requested: std::sync::atomic::AtomicBool,
    pub(crate) notify: tokio::sync::Notify,
}

impl AgentInner {
    pub(crate) fn new() -> Self {
        Self {
            stop_requested: std::sync::atomic::AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        if !self
            .stop_requested
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_requested
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Handle to a running in-process agent instance.
pub struct AgentHandle {
    pub(crate) inner: Arc<AgentInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Cloneable stop trigger detached from the [`AgentHandle`].
#[derive(Clone)]
pub struct AgentRemote(pub(crate) Arc<AgentInner>);

impl AgentRemote {
    /// Request a graceful shutdown (finish in-flight ops, stop leasing).
    pub fn request_stop(&self) {
        self.0.request_stop();
    }
}

impl AgentHandle {
    /// Request a graceful shutdown (finish in-flight ops, stop leasing).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// A stop trigger that can be moved into a signal handler task.
    pub fn remote(&self) -> AgentRemote {
        AgentRemote(self.inner.clone())
    }

    /// Wait for the agent to stop, returning the runtime result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("agent task join error: {err}")),
        }
    }
}

/// Start a new in-process agent instance.
pub fn start_agent(config: AgentConfig) -> AgentHandle {
    crate::engine::start_agent(config)
}
