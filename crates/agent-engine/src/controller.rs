//! JSON-over-HTTP controller protocol.
//!
//! Two dialects exist in the fleet. The legacy dialect registers and
//! heartbeats explicitly, leases one task per `GET /task` poll and posts to
//! `POST /result`; its endpoints live under a configurable prefix that is
//! discovered at call time. The bundle dialect folds registration into
//! `POST /v1/leases` (metrics and the worker profile travel in the lease
//! body) and posts to `POST /v1/results`.
//!
//! Identity aliasing: task ids arrive as `id`, `job_id` or `task_id`
//! depending on controller version; the first present form is accepted, and
//! legacy result posts write all three so either version matches.

use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use serde_json::{Map, Value, json};

use fabric_agent_core::metrics::HostSampler;

/// Typed failure at the controller boundary.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Connection-level failure: refused, unreachable, timed out. Maps to
    /// the wire sentinel `code = 0`.
    #[error("connect: {0}")]
    Connect(String),
    /// A non-2xx response other than 204.
    #[error("http {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// Malformed response: bad JSON, missing identity, non-object task.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for ControllerError {
    fn from(err: reqwest::Error) -> Self {
        ControllerError::Connect(err.to_string())
    }
}

async fn http_error(res: reqwest::Response) -> ControllerError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    ControllerError::Http { status, body }
}

/// A leased unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Controller-side job identity.
    pub job_id: String,
    /// Op name to execute.
    pub op: String,
    /// Handler payload; absent and `null` are treated as an empty object.
    pub payload: Option<Value>,
    /// Opaque epoch echoed back verbatim on the result post.
    pub job_epoch: Option<Value>,
    /// Bundle identity binding this task's result post (bundle dialect).
    pub lease_id: Option<String>,
}

/// Outcome of one task, ready to post.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// Whether the op succeeded.
    pub ok: bool,
    /// Op result on success, `null` on failure.
    pub result: Value,
    /// Structured error on failure, `null` on success.
    pub error: Value,
}

fn parse_task(value: Value, lease_id: Option<String>) -> Result<Task, ControllerError> {
    let Value::Object(map) = value else {
        return Err(ControllerError::Protocol(format!(
            "task is not an object: {value}"
        )));
    };

    let job_id = ["id", "job_id", "task_id"]
        .iter()
        .find_map(|key| map.get(*key))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ControllerError::Protocol("task missing job id".into()))?;

    let op = map
        .get("op")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ControllerError::Protocol("task missing op".into()))?
        .to_string();

    let payload = map.get("payload").cloned();
    if let Some(payload) = &payload {
        if !payload.is_object() && !payload.is_null() {
            return Err(ControllerError::Protocol("task payload not an object".into()));
        }
    }

    Ok(Task {
        job_id,
        op,
        payload,
        job_epoch: map.get("job_epoch").cloned().filter(|v| !v.is_null()),
        lease_id,
    })
}

fn trim_base(url: &reqwest::Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// Candidate paths for a legacy endpoint: the cached choice if one exists,
/// otherwise the prefixed path followed by the bare path.
fn candidate_paths(prefix: &str, path: &str, cached: Option<&str>) -> Vec<String> {
    match cached {
        Some(p) => vec![p.to_string()],
        None => {
            let prefixed = format!("{prefix}{path}");
            if prefixed == path {
                vec![path.to_string()]
            } else {
                vec![prefixed, path.to_string()]
            }
        }
    }
}

#[derive(Debug, Default)]
struct LegacyPaths {
    register: Option<String>,
    heartbeat: Option<String>,
    lease: Option<String>,
}

/// Client for the legacy single-task dialect.
#[derive(Debug)]
pub struct LegacyController {
    http: reqwest::Client,
    base: String,
    prefix: String,
    agent: String,
    labels: Map<String, Value>,
    caps: Vec<String>,
    profile_wire: Value,
    wait_ms: u64,
    sampler: Arc<HostSampler>,
    paths: Mutex<LegacyPaths>,
}

const REGISTER_PATH: &str = "/agents/register";
const HEARTBEAT_PATH: &str = "/agents/heartbeat";
const LEASE_PATH: &str = "/task";
const RESULT_PATH: &str = "/result";

#[derive(Debug, Clone, Copy)]
enum LegacyEndpoint {
    Register,
    Heartbeat,
    Lease,
}

impl LegacyController {
    /// Build a legacy-dialect client.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        controller_url: &reqwest::Url,
        prefix: String,
        agent: String,
        labels: Map<String, Value>,
        caps: Vec<String>,
        profile_wire: Value,
        wait_ms: u64,
        sampler: Arc<HostSampler>,
    ) -> Self {
        Self {
            http,
            base: trim_base(controller_url),
            prefix,
            agent,
            labels,
            caps,
            profile_wire,
            wait_ms,
            sampler,
            paths: Mutex::new(LegacyPaths::default()),
        }
    }

    fn cached_path(&self, endpoint: LegacyEndpoint) -> Option<String> {
        let paths = self.paths.lock().expect("endpoint cache lock poisoned");
        match endpoint {
            LegacyEndpoint::Register => paths.register.clone(),
            LegacyEndpoint::Heartbeat => paths.heartbeat.clone(),
            LegacyEndpoint::Lease => paths.lease.clone(),
        }
    }

    fn store_path(&self, endpoint: LegacyEndpoint, path: Option<String>) {
        let mut paths = self.paths.lock().expect("endpoint cache lock poisoned");
        match endpoint {
            LegacyEndpoint::Register => paths.register = path,
            LegacyEndpoint::Heartbeat => paths.heartbeat = path,
            LegacyEndpoint::Lease => paths.lease = path,
        }
    }

    /// Try each candidate path for `endpoint`, caching the first that
    /// answers with anything other than a connection failure or 404. A 404
    /// from a previously cached path clears the cache so the next call
    /// re-probes.
    async fn send_discovered(
        &self,
        endpoint: LegacyEndpoint,
        default_path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ControllerError> {
        let cached = self.cached_path(endpoint);
        let candidates = candidate_paths(&self.prefix, default_path, cached.as_deref());
        let wait_ms = self.wait_ms.to_string();

        let mut last_err = ControllerError::Connect("no endpoint candidates".into());
        for path in candidates {
            let url = format!("{}{}", self.base, path);
            let req = match body {
                Some(body) => self.http.post(&url).json(body),
                None => self.http.get(&url).query(&[
                    ("agent", self.agent.as_str()),
                    ("wait_ms", wait_ms.as_str()),
                ]),
            };

            match req.send().await {
                Err(err) => {
                    last_err = ControllerError::Connect(err.to_string());
                }
                Ok(res) if res.status() == StatusCode::NOT_FOUND => {
                    self.store_path(endpoint, None);
                    last_err = http_error(res).await;
                }
                Ok(res) => {
                    self.store_path(endpoint, Some(path));
                    return Ok(res);
                }
            }
        }
        Err(last_err)
    }

    fn register_body(&self) -> Value {
        let mut labels = self.labels.clone();
        labels.insert("worker_profile".into(), self.profile_wire.clone());
        json!({
            "agent": self.agent,
            "labels": labels,
            "capabilities": { "ops": self.caps },
            "metrics": self.sampler.sample(),
        })
    }

    /// One registration attempt; the supervisor retries until success.
    pub async fn register_once(&self) -> Result<(), ControllerError> {
        let body = self.register_body();
        let res = self
            .send_discovered(LegacyEndpoint::Register, REGISTER_PATH, Some(&body))
            .await?;
        if !res.status().is_success() {
            return Err(http_error(res).await);
        }
        Ok(())
    }

    /// One heartbeat. Failures never interrupt work.
    pub async fn heartbeat_once(&self) -> Result<(), ControllerError> {
        let body = json!({
            "agent": self.agent,
            "metrics": self.sampler.sample(),
        });
        let res = self
            .send_discovered(LegacyEndpoint::Heartbeat, HEARTBEAT_PATH, Some(&body))
            .await?;
        if !res.status().is_success() {
            return Err(http_error(res).await);
        }
        Ok(())
    }

    /// Poll for one task. An empty body object means no work.
    pub async fn lease(&self) -> Result<Vec<Task>, ControllerError> {
        let res = self
            .send_discovered(LegacyEndpoint::Lease, LEASE_PATH, None)
            .await?;
        if !res.status().is_success() {
            return Err(http_error(res).await);
        }

        let body: Value = res
            .json()
            .await
            .map_err(|err| ControllerError::Protocol(format!("lease body: {err}")))?;
        match &body {
            Value::Object(map) if map.is_empty() => Ok(Vec::new()),
            Value::Null => Ok(Vec::new()),
            Value::Object(_) => Ok(vec![parse_task(body, None)?]),
            other => Err(ControllerError::Protocol(format!(
                "lease body not an object: {other}"
            ))),
        }
    }

    /// Post one result. The path is fixed by the prefix; a 404 falls back
    /// to the bare `/result` once.
    pub async fn post_result(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), ControllerError> {
        let body = json!({
            "agent": self.agent,
            "task_id": task.job_id,
            "id": task.job_id,
            "job_id": task.job_id,
            "status": if result.ok { "ok" } else { "error" },
            "result": result.result,
            "error": result.error,
        });

        let url = format!("{}{}{}", self.base, self.prefix, RESULT_PATH);
        let res = self.http.post(&url).json(&body).send().await?;
        let res = if res.status() == StatusCode::NOT_FOUND {
            let fallback = format!("{}{}", self.base, RESULT_PATH);
            self.http.post(&fallback).json(&body).send().await?
        } else {
            res
        };

        if !res.status().is_success() {
            return Err(http_error(res).await);
        }
        Ok(())
    }
}

/// Client for the lease-bundle dialect.
#[derive(Debug)]
pub struct BundleController {
    http: reqwest::Client,
    base: String,
    agent: String,
    labels: Map<String, Value>,
    caps: Vec<String>,
    profile_wire: Value,
    max_tasks: u32,
    timeout_ms: u64,
    sampler: Arc<HostSampler>,
}

const LEASES_PATH: &str = "/v1/leases";
const RESULTS_PATH: &str = "/v1/results";

impl BundleController {
    /// Build a bundle-dialect client.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        controller_url: &reqwest::Url,
        agent: String,
        labels: Map<String, Value>,
        caps: Vec<String>,
        profile_wire: Value,
        max_tasks: u32,
        timeout_ms: u64,
        sampler: Arc<HostSampler>,
    ) -> Self {
        Self {
            http,
            base: trim_base(controller_url),
            agent,
            labels,
            caps,
            profile_wire,
            max_tasks,
            timeout_ms,
            sampler,
        }
    }

    /// Lease up to `max_tasks` tasks in one bundle. `204` means no work.
    pub async fn lease(&self) -> Result<Vec<Task>, ControllerError> {
        let body = json!({
            "agent": self.agent,
            "capabilities": { "ops": self.caps },
            "max_tasks": self.max_tasks,
            "timeout_ms": self.timeout_ms,
            "labels": self.labels,
            "worker_profile": self.profile_wire,
            "metrics": self.sampler.sample(),
        });

        let url = format!("{}{}", self.base, LEASES_PATH);
        let res = self.http.post(&url).json(&body).send().await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            return Err(http_error(res).await);
        }

        let body: Value = res
            .json()
            .await
            .map_err(|err| ControllerError::Protocol(format!("lease body: {err}")))?;
        let Value::Object(map) = body else {
            return Err(ControllerError::Protocol("lease body not an object".into()));
        };

        let lease_id = map
            .get("lease_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ControllerError::Protocol("lease missing lease_id".into()))?
            .to_string();

        let tasks = match map.get("tasks") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(tasks)) => tasks,
            Some(other) => {
                return Err(ControllerError::Protocol(format!(
                    "lease tasks not a list: {other}"
                )));
            }
        };

        tasks
            .iter()
            .map(|t| parse_task(t.clone(), Some(lease_id.clone())))
            .collect()
    }

    /// Post one result, echoing the bundle's lease id and the task's epoch
    /// verbatim.
    pub async fn post_result(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), ControllerError> {
        let body = json!({
            "lease_id": task.lease_id,
            "job_id": task.job_id,
            "job_epoch": task.job_epoch,
            "status": if result.ok { "succeeded" } else { "failed" },
            "result": result.result,
            "error": result.error,
        });

        let url = format!("{}{}", self.base, RESULTS_PATH);
        let res = self.http.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(http_error(res).await);
        }
        Ok(())
    }
}

/// The dialect-independent controller client held by the supervisor and the
/// workers.
#[derive(Debug)]
pub enum ControllerClient {
    /// Legacy single-task dialect.
    Legacy(LegacyController),
    /// Lease-bundle dialect.
    Bundle(BundleController),
}

impl ControllerClient {
    /// Register with the controller. The bundle dialect has no explicit
    /// registration; leasing carries the agent's identity.
    pub async fn register(&self) -> Result<(), ControllerError> {
        match self {
            ControllerClient::Legacy(c) => c.register_once().await,
            ControllerClient::Bundle(_) => Ok(()),
        }
    }

    /// Whether this dialect runs a heartbeat loop.
    pub fn has_heartbeat(&self) -> bool {
        matches!(self, ControllerClient::Legacy(_))
    }

    /// Send one heartbeat (legacy dialect only).
    pub async fn heartbeat(&self) -> Result<(), ControllerError> {
        match self {
            ControllerClient::Legacy(c) => c.heartbeat_once().await,
            ControllerClient::Bundle(_) => Ok(()),
        }
    }

    /// Lease zero or more tasks.
    pub async fn lease(&self) -> Result<Vec<Task>, ControllerError> {
        match self {
            ControllerClient::Legacy(c) => c.lease().await,
            ControllerClient::Bundle(c) => c.lease().await,
        }
    }

    /// Post one task result.
    pub async fn post_result(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), ControllerError> {
        match self {
            ControllerClient::Legacy(c) => c.post_result(task, result).await,
            ControllerClient::Bundle(c) => c.post_result(task, result).await,
        }
    }
}
