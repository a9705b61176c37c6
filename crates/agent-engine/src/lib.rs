#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process agent runtime for the compute fabric: controller protocol
//! client, self-scaling worker pool and supervisor.

/// Public API for the agent runtime.
pub mod api;

mod autoscaler;
mod controller;
mod engine;
mod pool;
mod worker;

pub use api::{
    AgentConfig, AgentHandle, AgentRemote, Dialect, ScaleConfig, StartError, start_agent,
};
pub use controller::{
    BundleController, ControllerClient, ControllerError, LegacyController, Task, TaskResult,
};
