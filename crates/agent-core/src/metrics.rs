//! Host metrics reported on register/heartbeat/lease and consumed by the
//! autoscaler's CPU-headroom gate.

use std::sync::Mutex;

use serde::Serialize;
use sysinfo::System;

/// Metrics snapshot attached to controller requests.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HostMetrics {
    /// Whole-host CPU utilization in `0.0..=1.0`.
    pub cpu_util: f64,
    /// Used physical memory in MiB.
    pub ram_mb: f64,
}

/// Shared `sysinfo` sampler.
///
/// CPU usage is computed from the delta between refreshes, so the first
/// sample after startup reads as zero; callers that gate on utilization
/// tolerate that (an idle reading only permits growth).
#[derive(Debug)]
pub struct HostSampler {
    sys: Mutex<System>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> HostMetrics {
        let mut sys = self.sys.lock().expect("host sampler lock poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        HostMetrics {
            cpu_util: f64::from(sys.global_cpu_usage()) / 100.0,
            ram_mb: sys.used_memory() as f64 / (1024.0 * 1024.0),
        }
    }

    /// Whole-host CPU utilization as a percentage (`0.0..=100.0`).
    pub fn cpu_util_pct(&self) -> f32 {
        let mut sys = self.sys.lock().expect("host sampler lock poisoned");
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }

    /// Bytes of memory currently available to new allocations.
    pub fn available_memory_bytes(&self) -> u64 {
        let mut sys = self.sys.lock().expect("host sampler lock poisoned");
        sys.refresh_memory();
        sys.available_memory()
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_bounded() {
        let sampler = HostSampler::new();
        let m = sampler.sample();
        assert!((0.0..=1.0).contains(&m.cpu_util));
        assert!(m.ram_mb >= 0.0);
    }

    #[test]
    fn cpu_pct_is_bounded() {
        let sampler = HostSampler::new();
        let pct = sampler.cpu_util_pct();
        assert!((0.0..=100.0).contains(&pct));
    }
}
