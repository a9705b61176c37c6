use std::time::Duration;

use clap::{Parser, ValueEnum};
use reqwest::Url;

use fabric_agent_core::labels::parse_labels;
use fabric_agent_core::profile::{ProfileOptions, WorkerProfile};
use fabric_agent_engine::{AgentConfig, Dialect, ScaleConfig};
use fabric_agent_ops::registry::TaskFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    /// Legacy single-task dialect (register/heartbeat/`/task`/`/result`).
    Legacy,
    /// Lease-bundle dialect (`/v1/leases` / `/v1/results`).
    Bundle,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Legacy => Dialect::Legacy,
            DialectArg::Bundle => Dialect::Bundle,
        }
    }
}

fn parse_byte_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("byte size must not be empty".to_string());
    }

    let lower = s.to_ascii_lowercase();
    let (num, scale) = if let Some(raw) = lower.strip_suffix("kib") {
        (raw, 1024u64)
    } else if let Some(raw) = lower.strip_suffix("mib") {
        (raw, 1024u64 * 1024)
    } else if let Some(raw) = lower.strip_suffix("gib") {
        (raw, 1024u64 * 1024 * 1024)
    } else if let Some(raw) = lower.strip_suffix("kb") {
        (raw, 1000u64)
    } else if let Some(raw) = lower.strip_suffix("mb") {
        (raw, 1000u64 * 1000)
    } else if let Some(raw) = lower.strip_suffix("gb") {
        (raw, 1000u64 * 1000 * 1000)
    } else if let Some(raw) = lower.strip_suffix('b') {
        (raw, 1u64)
    } else {
        // Bare numbers are plain bytes.
        (lower.as_str(), 1u64)
    };

    let num = num.trim();
    if num.is_empty() {
        return Err(format!("invalid byte size: {input:?}"));
    }

    let value: u64 = num
        .parse()
        .map_err(|_| format!("invalid byte size number: {input:?}"))?;

    value
        .checked_mul(scale)
        .ok_or_else(|| format!("byte size too large: {input:?}"))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "fabric-agent", version, about = "Compute-fabric worker agent")]
pub struct Cli {
    /// Controller base URL.
    #[arg(long, env = "CONTROLLER_URL")]
    pub controller_url: Url,

    /// Controller protocol dialect.
    #[arg(long, env = "CONTROLLER_DIALECT", value_enum, default_value_t = DialectArg::Bundle)]
    pub dialect: DialectArg,

    /// Endpoint prefix tried first by legacy-dialect discovery.
    #[arg(long, env = "API_PREFIX", default_value = "/api")]
    pub api_prefix: String,

    /// Agent identity; defaults to the host name.
    #[arg(long, env = "AGENT_NAME", default_value_t = fabric_agent_core::default_agent_name())]
    pub agent_name: String,

    /// Comma list of ops to serve. Empty, `*` or `all` serve everything
    /// allow-listed; `none` serves nothing.
    #[arg(long, env = "TASKS", default_value = "")]
    pub tasks: String,

    /// `k=v,k2=v2` tags reported to the controller.
    #[arg(long, env = "AGENT_LABELS", default_value = "")]
    pub agent_labels: String,

    #[arg(long, env = "HEARTBEAT_SEC", default_value_t = 3.0)]
    pub heartbeat_sec: f64,

    /// Lease long-poll budget, in milliseconds.
    #[arg(long, env = "WAIT_MS", default_value_t = AgentConfig::DEFAULT_WAIT_MS)]
    pub wait_ms: u64,

    /// Max tasks per lease bundle (bundle dialect).
    #[arg(
        long,
        env = "MAX_TASKS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_tasks: u32,

    /// Sleep after an empty poll, in seconds.
    #[arg(long, env = "LEASE_IDLE_SEC", default_value_t = 0.05)]
    pub lease_idle_sec: f64,

    /// Total HTTP timeout in seconds; defaults to 6 (legacy) or 10
    /// (bundle).
    #[arg(long, env = "HTTP_TIMEOUT")]
    pub http_timeout: Option<f64>,

    /// Sleep after a lease failure, in seconds.
    #[arg(long, env = "ERROR_BACKOFF_SEC", default_value_t = 1.0)]
    pub error_backoff_sec: f64,

    /// Per-key window for rate-limited error logs, in seconds.
    #[arg(long, env = "ERROR_LOG_EVERY_SEC", default_value_t = 10.0)]
    pub error_log_every_sec: f64,

    /// Bound on the shutdown drain, in seconds.
    #[arg(long, env = "SHUTDOWN_GRACE_SEC", default_value_t = 30.0)]
    pub shutdown_grace_sec: f64,

    /// Workers kept alive even when idle.
    #[arg(
        long,
        env = "CPU_MIN_WORKERS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub cpu_min_workers: u16,

    /// Target in-flight tasks per usable core (clamped to >= 1).
    #[arg(long, env = "CPU_PIPELINE_FACTOR", default_value_t = 4.0)]
    pub cpu_pipeline_factor: f64,

    /// CPU utilization (percent) above which the pool stops growing.
    #[arg(
        long,
        env = "TARGET_CPU_UTIL_PCT",
        default_value_t = 80,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub target_cpu_util_pct: u8,

    /// Autoscaler tick in seconds (clamped to >= 0.2).
    #[arg(long, env = "SCALE_TICK_SEC", default_value_t = 1.0)]
    pub scale_tick_sec: f64,

    /// Consecutive idle ticks before one reap.
    #[arg(long, env = "IDLE_REAP_TICKS", default_value_t = 6)]
    pub idle_reap_ticks: u32,

    /// Workers spawned per grow decision.
    #[arg(
        long,
        env = "SPAWN_STEP",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub spawn_step: u16,

    /// Workers reaped per shrink decision.
    #[arg(
        long,
        env = "REAP_STEP",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub reap_step: u16,

    /// Explicit override for the worker soft cap.
    #[arg(long, env = "WORKER_SOFT_GUARD")]
    pub worker_soft_guard: Option<u16>,

    #[arg(long, env = "CPU_RESERVED_CORES_FLOOR", default_value_t = 1)]
    pub cpu_reserved_cores_floor: u16,

    #[arg(long, env = "CPU_RESERVED_CORES_CAP", default_value_t = 4)]
    pub cpu_reserved_cores_cap: u16,

    #[arg(long, env = "CPU_SOFT_CAP_MULTIPLIER", default_value_t = 8.0)]
    pub cpu_soft_cap_multiplier: f64,

    /// Per-worker memory budget for the memory-bounded soft cap (e.g.
    /// `32MiB`).
    #[arg(
        long,
        env = "CPU_PER_WORKER_BYTES",
        default_value = "32MiB",
        value_parser = parse_byte_size
    )]
    pub cpu_per_worker_bytes: u64,

    /// Disable TPU detection entirely.
    #[arg(long, env = "TPU_DISABLED", default_value_t = false)]
    pub tpu_disabled: bool,

    /// TPU-only mode: CPU caps collapse to 1 and GPU is reported absent.
    #[arg(long, env = "TPU_ONLY", default_value_t = false)]
    pub tpu_only: bool,

    /// Advisory TPU kind tag.
    #[arg(long, env = "TPU_KIND")]
    pub tpu_kind: Option<String>,

    /// Default model path for accelerator ops.
    #[arg(long, env = "TPU_MODEL_PATH")]
    pub tpu_model_path: Option<String>,
}

impl Cli {
    pub fn profile_options(&self) -> ProfileOptions {
        ProfileOptions {
            min_workers: usize::from(self.cpu_min_workers),
            pipeline_factor: self.cpu_pipeline_factor,
            reserved_floor: usize::from(self.cpu_reserved_cores_floor),
            reserved_cap: usize::from(self.cpu_reserved_cores_cap),
            soft_cap_multiplier: self.cpu_soft_cap_multiplier,
            per_worker_bytes: self.cpu_per_worker_bytes,
            soft_guard_override: self.worker_soft_guard.map(usize::from),
            tpu_disabled: self.tpu_disabled,
            tpu_only: self.tpu_only,
            tpu_kind: self.tpu_kind.clone(),
        }
    }

    pub fn agent_config(&self, profile: WorkerProfile) -> AgentConfig {
        let dialect: Dialect = self.dialect.into();
        let http_timeout = self.http_timeout.unwrap_or(match dialect {
            Dialect::Legacy => 6.0,
            Dialect::Bundle => 10.0,
        });

        AgentConfig {
            controller_url: self.controller_url.clone(),
            dialect,
            api_prefix: self.api_prefix.clone(),
            agent_name: self.agent_name.clone(),
            labels: parse_labels(&self.agent_labels),
            task_filter: TaskFilter::parse(&self.tasks),
            profile,
            heartbeat: Duration::from_secs_f64(self.heartbeat_sec.max(0.5)),
            wait_ms: self.wait_ms,
            max_tasks: self.max_tasks,
            lease_idle: Duration::from_secs_f64(self.lease_idle_sec.max(0.0)),
            error_backoff: Duration::from_secs_f64(self.error_backoff_sec.max(0.0)),
            http_timeout: Duration::from_secs_f64(http_timeout.max(0.5)),
            error_log_every: Duration::from_secs_f64(self.error_log_every_sec.max(0.0)),
            shutdown_grace: Duration::from_secs_f64(self.shutdown_grace_sec.max(0.0)),
            scale: ScaleConfig {
                target_cpu_util_pct: f32::from(self.target_cpu_util_pct),
                tick: Duration::from_secs_f64(self.scale_tick_sec.max(0.0))
                    .max(AgentConfig::MIN_SCALE_TICK),
                idle_reap_ticks: self.idle_reap_ticks,
                spawn_step: usize::from(self.spawn_step),
                reap_step: usize::from(self.reap_step),
            },
            default_model_path: self.tpu_model_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["fabric-agent", "--controller-url", "http://127.0.0.1:8080"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn byte_sizes_accept_suffixes() {
        assert_eq!(parse_byte_size("32MiB").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_byte_size("1gb").unwrap(), 1_000_000_000);
        assert_eq!(parse_byte_size("512").unwrap(), 512);
        assert!(parse_byte_size("lots").is_err());
    }

    #[test]
    fn http_timeout_defaults_per_dialect() {
        let cli = parse(&[]);
        let profile = fabric_agent_core::profile::build_worker_profile(
            &cli.profile_options(),
            None,
        );
        let cfg = cli.agent_config(profile.clone());
        assert_eq!(cfg.http_timeout, Duration::from_secs(10));

        let cli = parse(&["--dialect", "legacy"]);
        let cfg = cli.agent_config(profile);
        assert_eq!(cfg.http_timeout, Duration::from_secs(6));
    }

    #[test]
    fn scale_tick_is_clamped() {
        let cli = parse(&["--scale-tick-sec", "0.01"]);
        let profile = fabric_agent_core::profile::build_worker_profile(
            &cli.profile_options(),
            None,
        );
        let cfg = cli.agent_config(profile);
        assert_eq!(cfg.scale.tick, Duration::from_millis(200));
    }

    #[test]
    fn task_and_label_values_flow_through() {
        let cli = parse(&["--tasks", "echo,fibonacci", "--agent-labels", "zone=eu"]);
        let profile = fabric_agent_core::profile::build_worker_profile(
            &cli.profile_options(),
            None,
        );
        let cfg = cli.agent_config(profile);
        assert!(matches!(cfg.task_filter, TaskFilter::Listed(_)));
        assert_eq!(cfg.labels.get("zone").unwrap(), "eu");
    }
}
