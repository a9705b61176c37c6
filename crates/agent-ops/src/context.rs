//! Process-wide state shared by op handlers.

use crate::tpu::TpuRuntime;

/// Shared handler context: one HTTP client for webhook ops and the lazily
/// acquired TPU runtime. Built once by the supervisor and passed to every
/// handler invocation.
#[derive(Debug)]
pub struct OpContext {
    pub http: reqwest::Client,
    pub tpu: TpuRuntime,
    /// Default model path for accelerator ops (`TPU_MODEL_PATH`).
    pub default_model_path: Option<String>,
}

impl OpContext {
    pub fn new(http: reqwest::Client, default_model_path: Option<String>) -> Self {
        Self {
            http,
            tpu: TpuRuntime::new(),
            default_model_path,
        }
    }
}
