//! Allow-list, `TASKS` gating, lazy loading and dispatch.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;

use fabric_agent_core::signals::PressureSignals;

use crate::context::OpContext;
use crate::error::ErrorBody;
use crate::{JsonMap, OpHandler, classify_tpu, csv_shard, echo, fibonacci, prime_factor, risk,
            sat_verify, subset_sum, summarize, tokenize, webhook};

type Loader = fn(&OpContext) -> Result<OpHandler, String>;

/// Op name to lazy loader. This is the allow-list: names absent here are
/// unknown no matter what `TASKS` says.
const ALLOW_LIST: &[(&str, Loader)] = &[
    ("echo", echo::load),
    ("map_tokenize", tokenize::load),
    ("map_summarize", summarize::load),
    // Two names for the CSV shard reader, kept for older controllers.
    ("csv_shard", csv_shard::load),
    ("read_csv_shard", csv_shard::load),
    ("risk_accumulate", risk::load),
    ("fibonacci", fibonacci::load),
    ("prime_factor", prime_factor::load),
    ("sat_verify", sat_verify::load),
    ("subset_sum", subset_sum::load),
    ("map_classify_tpu", classify_tpu::load),
    ("trigger_sap", webhook::load_sap),
    ("trigger_oracle", webhook::load_oracle),
];

fn allow_listed(name: &str) -> Option<Loader> {
    ALLOW_LIST
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, loader)| *loader)
}

/// Parsed form of the `TASKS` configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    /// Empty value, `*` or `all`: serve everything allow-listed.
    All,
    /// `none`: serve nothing.
    None,
    /// Comma-separated names, intersected with the allow-list.
    Listed(BTreeSet<String>),
}

impl TaskFilter {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*" || raw.eq_ignore_ascii_case("all") {
            return TaskFilter::All;
        }
        if raw.eq_ignore_ascii_case("none") {
            return TaskFilter::None;
        }
        let listed = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        TaskFilter::Listed(listed)
    }
}

/// Why `resolve` failed.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown op {name:?}; enabled ops: {enabled:?}{load_errors}")]
    Unknown {
        name: String,
        enabled: Vec<String>,
        load_errors: LoadErrorSuffix,
    },
    #[error("op {name:?} is disabled by TASKS; enabled ops: {enabled:?}")]
    Disabled { name: String, enabled: Vec<String> },
    #[error("op {name:?} failed to load: {error}")]
    LoadFailure { name: String, error: String },
}

impl ResolveError {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Unknown { .. } => "UnknownOp",
            ResolveError::Disabled { .. } => "DisabledOp",
            ResolveError::LoadFailure { .. } => "LoadError",
        }
    }
}

/// Formats the recorded load errors appended to unknown-op messages.
#[derive(Debug, Clone, Default)]
pub struct LoadErrorSuffix(Vec<(String, String)>);

impl std::fmt::Display for LoadErrorSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        let shown: Vec<String> = self
            .0
            .iter()
            .take(10)
            .map(|(op, err)| format!("{op} => {err}"))
            .collect();
        write!(f, "; op load errors: {}", shown.join("; "))?;
        if self.0.len() > 10 {
            write!(f, " (+{} more)", self.0.len() - 10)?;
        }
        Ok(())
    }
}

/// The op registry and dispatcher.
#[derive(Debug)]
pub struct Registry {
    ctx: Arc<OpContext>,
    enabled: BTreeSet<String>,
    handlers: RwLock<HashMap<String, OpHandler>>,
    load_errors: Mutex<Vec<(String, String)>>,
}

/// Outcome of one dispatched op execution.
#[derive(Debug)]
pub struct ExecOutcome {
    pub ok: bool,
    pub result: Value,
    pub error: Option<ErrorBody>,
    pub elapsed: Duration,
}

impl ExecOutcome {
    fn failed(error: ErrorBody, elapsed: Duration) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(error),
            elapsed,
        }
    }
}

impl Registry {
    pub fn new(ctx: Arc<OpContext>, filter: &TaskFilter) -> Self {
        let enabled = match filter {
            TaskFilter::All => ALLOW_LIST.iter().map(|(n, _)| n.to_string()).collect(),
            TaskFilter::None => BTreeSet::new(),
            TaskFilter::Listed(names) => names
                .iter()
                .filter(|n| allow_listed(n).is_some())
                .cloned()
                .collect(),
        };
        Self {
            ctx,
            enabled,
            handlers: RwLock::new(HashMap::new()),
            load_errors: Mutex::new(Vec::new()),
        }
    }

    /// Sorted op names that are allow-listed and enabled by `TASKS`.
    pub fn enabled_ops(&self) -> Vec<String> {
        self.enabled.iter().cloned().collect()
    }

    /// Add or replace a handler, bypassing the lazy loader.
    pub fn register(&self, name: &str, handler: OpHandler) {
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), handler);
    }

    /// Resolve an op name, lazily loading its handler on first use. After
    /// the first success the same handler is returned on every call.
    pub fn resolve(&self, name: &str) -> Result<OpHandler, ResolveError> {
        if let Some(handler) = self
            .handlers
            .read()
            .expect("registry lock poisoned")
            .get(name)
        {
            return Ok(handler.clone());
        }

        let Some(loader) = allow_listed(name) else {
            return Err(ResolveError::Unknown {
                name: name.to_string(),
                enabled: self.enabled_ops(),
                load_errors: LoadErrorSuffix(
                    self.load_errors
                        .lock()
                        .expect("load errors lock poisoned")
                        .clone(),
                ),
            });
        };
        if !self.enabled.contains(name) {
            return Err(ResolveError::Disabled {
                name: name.to_string(),
                enabled: self.enabled_ops(),
            });
        }

        match loader(&self.ctx) {
            Ok(handler) => {
                let mut handlers = self.handlers.write().expect("registry lock poisoned");
                // Another worker may have loaded it concurrently; first
                // insert wins so resolve stays stable.
                Ok(handlers
                    .entry(name.to_string())
                    .or_insert(handler)
                    .clone())
            }
            Err(error) => {
                tracing::error!(op = name, %error, "op handler failed to load");
                self.load_errors
                    .lock()
                    .expect("load errors lock poisoned")
                    .push((name.to_string(), error.clone()));
                Err(ResolveError::LoadFailure {
                    name: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Execute one op: validate, resolve, invoke, and convert any failure
    /// into a structured error. The inflight gauge brackets the handler
    /// call, including every failure path after resolution.
    pub async fn execute(
        &self,
        op: &str,
        payload: Option<&Value>,
        signals: &PressureSignals,
    ) -> ExecOutcome {
        let started = Instant::now();

        let payload = match payload {
            None | Some(Value::Null) => JsonMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return ExecOutcome::failed(
                    ErrorBody::new("ValidationError", "task payload must be a JSON object"),
                    started.elapsed(),
                );
            }
        };

        let handler = match self.resolve(op) {
            Ok(handler) => handler,
            Err(err) => {
                return ExecOutcome::failed(
                    ErrorBody::new(err.kind(), err.to_string()),
                    started.elapsed(),
                );
            }
        };

        signals.op_started();
        // The handler runs in its own task so a panic is caught by the join
        // handle instead of unwinding through the worker.
        let joined = tokio::spawn(handler.call(self.ctx.clone(), payload)).await;
        signals.op_finished();
        let elapsed = started.elapsed();

        match joined {
            Ok(Ok(result)) => ExecOutcome {
                ok: true,
                result,
                error: None,
                elapsed,
            },
            Ok(Err(op_err)) => ExecOutcome::failed(ErrorBody::from(&op_err), elapsed),
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "op handler panicked".to_string());
                ExecOutcome::failed(
                    ErrorBody::new("Panic", format!("op {op:?} panicked: {message}"))
                        .with_trace(message),
                    elapsed,
                )
            }
            Err(join_err) => ExecOutcome::failed(
                ErrorBody::new("RuntimeError", format!("op task join error: {join_err}")),
                elapsed,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(filter: &str) -> Registry {
        let ctx = Arc::new(OpContext::new(reqwest::Client::new(), None));
        Registry::new(ctx, &TaskFilter::parse(filter))
    }

    #[test]
    fn task_filter_tokens() {
        assert_eq!(TaskFilter::parse(""), TaskFilter::All);
        assert_eq!(TaskFilter::parse("*"), TaskFilter::All);
        assert_eq!(TaskFilter::parse("ALL"), TaskFilter::All);
        assert_eq!(TaskFilter::parse("none"), TaskFilter::None);
        let listed = TaskFilter::parse("echo, fibonacci,,");
        let TaskFilter::Listed(names) = listed else {
            panic!("expected listed filter");
        };
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn gating_intersects_with_allow_list() {
        let reg = registry("echo,fibonacci,not_a_real_op");
        assert_eq!(reg.enabled_ops(), vec!["echo", "fibonacci"]);

        let reg = registry("none");
        assert!(reg.enabled_ops().is_empty());

        let reg = registry("*");
        assert!(reg.enabled_ops().contains(&"subset_sum".to_string()));
    }

    #[test]
    fn resolve_distinguishes_unknown_and_disabled() {
        let reg = registry("echo");
        assert!(matches!(
            reg.resolve("nope"),
            Err(ResolveError::Unknown { .. })
        ));
        assert!(matches!(
            reg.resolve("fibonacci"),
            Err(ResolveError::Disabled { .. })
        ));
        assert!(reg.resolve("echo").is_ok());
    }

    #[tokio::test]
    async fn execute_unknown_op_lists_enabled_ops() {
        let reg = registry("echo,fibonacci");
        let signals = PressureSignals::new();
        let out = reg.execute("nope", Some(&json!({})), &signals).await;
        assert!(!out.ok);
        let err = out.error.unwrap();
        assert_eq!(err.kind, "UnknownOp");
        assert!(err.message.contains("echo"));
        assert!(err.message.contains("fibonacci"));
    }

    #[tokio::test]
    async fn execute_rejects_non_object_payload() {
        let reg = registry("echo");
        let signals = PressureSignals::new();
        let out = reg.execute("echo", Some(&json!([1, 2])), &signals).await;
        assert!(!out.ok);
        assert_eq!(out.error.unwrap().kind, "ValidationError");
    }

    #[tokio::test]
    async fn execute_null_payload_becomes_empty_object() {
        let reg = registry("echo");
        let signals = PressureSignals::new();
        let out = reg.execute("echo", None, &signals).await;
        assert!(out.ok);
        assert_eq!(out.result["echo"], json!({}));
    }

    #[tokio::test]
    async fn inflight_gauge_brackets_execution_even_on_failure() {
        let reg = registry("fibonacci");
        let signals = PressureSignals::new();
        let out = reg
            .execute("fibonacci", Some(&json!({"n": -1})), &signals)
            .await;
        assert!(!out.ok);
        assert_eq!(signals.inflight(), 0);
    }

    #[tokio::test]
    async fn panicking_handler_becomes_failed_result() {
        let reg = registry("*");
        reg.register(
            "echo",
            OpHandler::new(|_ctx, _payload| Box::pin(async { panic!("boom") })),
        );
        let signals = PressureSignals::new();
        let out = reg.execute("echo", Some(&json!({})), &signals).await;
        assert!(!out.ok);
        let err = out.error.unwrap();
        assert_eq!(err.kind, "Panic");
        assert!(err.message.contains("boom"));
        assert_eq!(signals.inflight(), 0);
    }

    #[test]
    fn resolve_returns_same_handler_after_first_success() {
        let reg = registry("echo");
        let first = reg.resolve("echo").unwrap();
        let second = reg.resolve("echo").unwrap();
        assert!(Arc::ptr_eq(&first.0, &second.0));
    }
}
