//! Handler error taxonomy and the wire error body.

use serde::Serialize;

/// Failure returned by an op handler.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// The payload was rejected before any work started. Never retried.
    #[error("{0}")]
    Validation(String),
    /// The handler started and failed.
    #[error("{0}")]
    Runtime(String),
    /// An accelerator the handler depends on could not be acquired.
    #[error("{0}")]
    Accelerator(String),
}

impl OpError {
    /// Wire tag for the `type` field of the structured error.
    pub fn kind(&self) -> &'static str {
        match self {
            OpError::Validation(_) => "ValidationError",
            OpError::Runtime(_) => "RuntimeError",
            OpError::Accelerator(_) => "AcceleratorError",
        }
    }
}

/// Structured error posted back to the controller on a failed task.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        let mut trace = trace.into();
        // Bound the trace so a pathological panic payload cannot bloat the
        // result post.
        const MAX_TRACE: usize = 4096;
        if trace.len() > MAX_TRACE {
            let mut cut = MAX_TRACE;
            while !trace.is_char_boundary(cut) {
                cut -= 1;
            }
            trace.truncate(cut);
            trace.push_str("… (truncated)");
        }
        self.trace = Some(trace);
        self
    }
}

impl From<&OpError> for ErrorBody {
    fn from(err: &OpError) -> Self {
        ErrorBody::new(err.kind(), err.to_string())
    }
}
