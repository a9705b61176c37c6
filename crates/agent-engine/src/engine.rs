//! The agent supervisor: composes profile, registry, controller client,
//! worker pool and autoscaler, and owns the lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;

use fabric_agent_core::metrics::HostSampler;
use fabric_agent_core::ratelimit::RateLimiter;
use fabric_agent_core::signals::PressureSignals;
use fabric_agent_ops::context::OpContext;
use fabric_agent_ops::registry::Registry;

use crate::api::{AgentConfig, AgentHandle, AgentInner, Dialect, StartError};
use crate::autoscaler::run_autoscaler;
use crate::controller::{BundleController, ControllerClient, LegacyController};
use crate::pool::WorkerPool;
use crate::worker::{WorkerShared, run_worker};

pub(crate) fn start_agent(cfg: AgentConfig) -> AgentHandle {
    let inner = Arc::new(AgentInner::new());
    let join = tokio::spawn(run_agent(inner.clone(), cfg));
    AgentHandle { inner, join }
}

fn build_controller(
    cfg: &AgentConfig,
    http: reqwest::Client,
    caps: Vec<String>,
    sampler: Arc<HostSampler>,
) -> ControllerClient {
    match cfg.dialect {
        Dialect::Legacy => ControllerClient::Legacy(LegacyController::new(
            http,
            &cfg.controller_url,
            cfg.api_prefix.clone(),
            cfg.agent_name.clone(),
            cfg.labels.clone(),
            caps,
            cfg.profile.wire(),
            cfg.wait_ms,
            sampler,
        )),
        Dialect::Bundle => ControllerClient::Bundle(BundleController::new(
            http,
            &cfg.controller_url,
            cfg.agent_name.clone(),
            cfg.labels.clone(),
            caps,
            cfg.profile.wire(),
            cfg.max_tasks,
            cfg.wait_ms,
            sampler,
        )),
    }
}

async fn run_agent(inner: Arc<AgentInner>, mut cfg: AgentConfig) -> anyhow::Result<()> {
    if cfg.wait_ms == 0 {
        cfg.wait_ms = AgentConfig::DEFAULT_WAIT_MS;
    }
    if cfg.lease_idle == Duration::ZERO {
        cfg.lease_idle = AgentConfig::DEFAULT_LEASE_IDLE;
    }
    if cfg.error_backoff == Duration::ZERO {
        cfg.error_backoff = AgentConfig::DEFAULT_ERROR_BACKOFF;
    }
    if cfg.heartbeat == Duration::ZERO {
        cfg.heartbeat = AgentConfig::DEFAULT_HEARTBEAT;
    }
    if cfg.error_log_every == Duration::ZERO {
        cfg.error_log_every = AgentConfig::DEFAULT_ERROR_LOG_EVERY;
    }
    if cfg.shutdown_grace == Duration::ZERO {
        cfg.shutdown_grace = AgentConfig::DEFAULT_SHUTDOWN_GRACE;
    }
    cfg.scale.tick = cfg.scale.tick.max(AgentConfig::MIN_SCALE_TICK);

    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout)
        .build()
        .context("build http client")?;

    let ops_ctx = Arc::new(OpContext::new(http.clone(), cfg.default_model_path.clone()));
    let registry = Registry::new(ops_ctx, &cfg.task_filter);
    let enabled = registry.enabled_ops();
    if enabled.is_empty() {
        return Err(StartError::NoOpsEnabled.into());
    }

    tracing::info!(
        agent = %cfg.agent_name,
        controller = %cfg.controller_url,
        dialect = ?cfg.dialect,
        ops = ?enabled,
        min_workers = cfg.profile.cpu.min_workers,
        soft_cap = cfg.profile.cpu.soft_cap,
        target_inflight = cfg.profile.cpu.target_inflight,
        "agent starting"
    );

    let sampler = Arc::new(HostSampler::new());
    let limiter = Arc::new(RateLimiter::new(cfg.error_log_every));
    let controller = Arc::new(build_controller(&cfg, http, enabled, sampler.clone()));

    // No worker leases before registration succeeds.
    loop {
        if inner.should_stop() {
            return Ok(());
        }
        match controller.register().await {
            Ok(()) => break,
            Err(err) => {
                if limiter.check("register") {
                    tracing::warn!(%err, "register failed; retrying");
                }
                let pause = Duration::from_millis(rand::rng().random_range(500..=1500));
                tokio::time::sleep(pause).await;
            }
        }
    }
    tracing::info!("registered with controller");

    let heartbeat_task = controller.has_heartbeat().then(|| {
        let controller = controller.clone();
        let inner = inner.clone();
        let limiter = limiter.clone();
        let period = cfg.heartbeat;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would duplicate the register call.
            interval.tick().await;
            loop {
                interval.tick().await;
                if inner.should_stop() {
                    return;
                }
                if let Err(err) = controller.heartbeat().await {
                    if limiter.check("heartbeat") {
                        tracing::warn!(%err, "heartbeat failed");
                    }
                }
            }
        })
    });

    let shared = Arc::new(WorkerShared {
        controller,
        registry,
        signals: Arc::new(PressureSignals::new()),
        inner: inner.clone(),
        limiter: limiter.clone(),
        lease_idle: cfg.lease_idle,
        error_backoff: cfg.error_backoff,
    });

    let pool = Arc::new(WorkerPool::new(
        cfg.profile.cpu.min_workers,
        cfg.profile.cpu.soft_cap,
    ));

    let spawn_one = {
        let pool = pool.clone();
        let shared = shared.clone();
        move || {
            pool.spawn(|id, stop_rx| {
                let shared = shared.clone();
                tokio::spawn(run_worker(id, stop_rx, shared))
            })
            .is_some()
        }
    };

    for _ in 0..pool.min_workers() {
        spawn_one();
    }
    tracing::info!(workers = pool.count(), "worker pool seeded");

    let scaler_task = {
        let pool = pool.clone();
        let signals = shared.signals.clone();
        let sampler = sampler.clone();
        let limiter = limiter.clone();
        let stop = inner.clone();
        let spawn_one = spawn_one.clone();
        tokio::spawn(run_autoscaler(
            cfg.scale.clone(),
            pool,
            signals,
            sampler,
            limiter,
            spawn_one,
            move || stop.should_stop(),
        ))
    };

    // Park until a stop request arrives.
    loop {
        let notified = inner.notify.notified();
        if inner.should_stop() {
            break;
        }
        notified.await;
    }

    tracing::info!("stop requested; draining workers");
    pool.stop_all();
    let handles = pool.take_handles();
    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(cfg.shutdown_grace, drain).await.is_err() {
        tracing::warn!(
            grace_secs = cfg.shutdown_grace.as_secs_f64(),
            "shutdown grace elapsed with ops still in flight"
        );
    }

    scaler_task.abort();
    if let Some(task) = heartbeat_task {
        task.abort();
    }
    tracing::info!("agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScaleConfig;
    use fabric_agent_core::profile::{
        GpuProfile, ProfileOptions, TpuProfile, compose, cpu_profile,
    };
    use fabric_agent_ops::registry::TaskFilter;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer, dialect: Dialect, filter: &str) -> AgentConfig {
        let opts = ProfileOptions::default();
        let profile = compose(
            &opts,
            cpu_profile(&opts, 4, None),
            GpuProfile::default(),
            TpuProfile::default(),
        );
        AgentConfig {
            controller_url: reqwest::Url::parse(&server.uri()).unwrap(),
            dialect,
            api_prefix: "/api".to_string(),
            agent_name: "agent-test".to_string(),
            labels: serde_json::Map::new(),
            task_filter: TaskFilter::parse(filter),
            profile,
            heartbeat: Duration::from_secs(30),
            wait_ms: 100,
            max_tasks: 1,
            lease_idle: Duration::from_millis(10),
            error_backoff: Duration::from_millis(50),
            http_timeout: Duration::from_secs(2),
            error_log_every: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            scale: ScaleConfig {
                tick: Duration::from_secs(30),
                ..ScaleConfig::default()
            },
            default_model_path: None,
        }
    }

    async fn wait_for_result_post(server: &MockServer, result_path: &str) {
        for _ in 0..100 {
            let posted = server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .any(|req| req.url.path() == result_path);
            if posted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no result posted to {result_path}");
    }

    #[tokio::test]
    async fn bundle_echo_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/leases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "lease_id": "L1",
                "tasks": [{
                    "job_id": "j1",
                    "op": "echo",
                    "payload": {"x": 1},
                    "job_epoch": 9,
                }],
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/leases"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/results"))
            .and(body_partial_json(json!({
                "lease_id": "L1",
                "job_id": "j1",
                "job_epoch": 9,
                "status": "succeeded",
                "result": {"ok": true, "echo": {"x": 1}},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let handle = start_agent(test_config(&server, Dialect::Bundle, "echo"));
        wait_for_result_post(&server, "/v1/results").await;
        handle.request_stop();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn legacy_discovers_prefixed_endpoints_and_reports_unknown_ops() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/agents/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "j1",
                "op": "nope",
                "payload": {},
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/task"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/result"))
            .and(body_partial_json(json!({"job_id": "j1", "status": "error"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let handle = start_agent(test_config(&server, Dialect::Legacy, "echo,fibonacci"));
        wait_for_result_post(&server, "/api/result").await;
        handle.request_stop();
        handle.wait().await.unwrap();

        // The failure message lists the enabled ops.
        let requests = server.received_requests().await.unwrap();
        let result_body = requests
            .iter()
            .find(|req| req.url.path() == "/api/result")
            .map(|req| String::from_utf8_lossy(&req.body).into_owned())
            .unwrap();
        assert!(result_body.contains("echo"));
        assert!(result_body.contains("fibonacci"));
        assert!(result_body.contains("UnknownOp"));
    }

    #[tokio::test]
    async fn empty_task_filter_is_a_startup_error() {
        let server = MockServer::start().await;
        let handle = start_agent(test_config(&server, Dialect::Bundle, "none"));
        let err = handle.wait().await.unwrap_err();
        assert!(err.downcast_ref::<StartError>().is_some());
    }
}
