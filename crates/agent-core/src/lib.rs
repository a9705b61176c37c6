#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared building blocks for the fabric agent: host capacity profiling,
//! host metrics sampling, pressure signals, label parsing and rate-limited
//! logging.

pub mod labels;
pub mod metrics;
pub mod profile;
pub mod ratelimit;
pub mod signals;

/// Default agent identity when `AGENT_NAME` is not set.
pub fn default_agent_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "agent".to_string())
}
