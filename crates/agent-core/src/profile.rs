//! Host capacity profiler.
//!
//! Runs once at startup and derives a [`WorkerProfile`]: how many workers
//! this host can reasonably run, plus accelerator presence. The profile is a
//! hint for the autoscaler and advisory telemetry for the controller, not a
//! scheduling policy; the autoscaler owns the actual pool size.

use std::path::Path;
use std::process::Command;

use serde::Serialize;

/// Tunables for the profiler, normally filled from the CLI/environment.
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    /// Floor for workers kept alive even when idle (`CPU_MIN_WORKERS`).
    pub min_workers: usize,
    /// In-flight tasks per usable core the autoscaler may target
    /// (`CPU_PIPELINE_FACTOR`, clamped to >= 1).
    pub pipeline_factor: f64,
    /// Reserved-core clamp floor (`CPU_RESERVED_CORES_FLOOR`).
    pub reserved_floor: usize,
    /// Reserved-core clamp cap (`CPU_RESERVED_CORES_CAP`).
    pub reserved_cap: usize,
    /// Core-based soft-cap multiplier (`CPU_SOFT_CAP_MULTIPLIER`).
    pub soft_cap_multiplier: f64,
    /// Per-worker memory budget for the memory-bounded ceiling
    /// (`CPU_PER_WORKER_BYTES`).
    pub per_worker_bytes: u64,
    /// Explicit guardrail override (`WORKER_SOFT_GUARD`).
    pub soft_guard_override: Option<usize>,
    /// Disable TPU detection entirely (`TPU_DISABLED`).
    pub tpu_disabled: bool,
    /// TPU-only mode: CPU caps collapse to 1, GPU reported absent
    /// (`TPU_ONLY`).
    pub tpu_only: bool,
    /// Advisory TPU kind tag (`TPU_KIND`); a hint, never proof.
    pub tpu_kind: Option<String>,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            min_workers: 1,
            pipeline_factor: 4.0,
            reserved_floor: 1,
            reserved_cap: 4,
            soft_cap_multiplier: 8.0,
            per_worker_bytes: 32 * 1024 * 1024,
            soft_guard_override: None,
            tpu_disabled: false,
            tpu_only: false,
            tpu_kind: None,
        }
    }
}

/// CPU sizing for the dynamic pipeline model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CpuProfile {
    pub total_cores: usize,
    pub reserved_cores: usize,
    pub usable_cores: usize,
    pub pipeline_factor: f64,
    #[serde(rename = "target_inflight_workers")]
    pub target_inflight: usize,
    #[serde(rename = "cpu_soft_cap_workers")]
    pub soft_cap: usize,
    #[serde(rename = "min_cpu_workers")]
    pub min_workers: usize,
    /// Legacy key kept for controller-side schema stability; mirrors the
    /// soft cap, which is a guardrail rather than a static maximum.
    #[serde(rename = "max_cpu_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GpuDevice {
    pub index: usize,
    pub name: String,
    pub total_memory_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GpuProfile {
    pub gpu_present: bool,
    pub gpu_count: usize,
    pub vram_gb: Option<f64>,
    pub devices: Vec<GpuDevice>,
    pub max_gpu_workers: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TpuProfile {
    pub tpu_present: bool,
    pub tpu_kind: Option<String>,
    pub devices: Vec<String>,
    pub max_tpu_workers: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerCounts {
    pub max_total_workers: usize,
    pub current_workers: usize,
}

/// Static host descriptor built once at startup. Immutable afterwards.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerProfile {
    pub cpu: CpuProfile,
    pub gpu: GpuProfile,
    pub tpu: TpuProfile,
    pub workers: WorkerCounts,
}

impl WorkerProfile {
    /// Wire form echoed to the controller (inside `labels` on legacy
    /// register, top-level on bundle lease).
    pub fn wire(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("worker profile serializes")
    }
}

/// Derive the CPU profile from raw inputs. Deterministic, no probing.
pub fn cpu_profile(
    opts: &ProfileOptions,
    total_cores: usize,
    available_bytes: Option<u64>,
) -> CpuProfile {
    let total_cores = total_cores.max(1);
    let reserved_cores = (total_cores / 4)
        .max(opts.reserved_floor)
        .min(opts.reserved_cap);
    let usable_cores = total_cores.saturating_sub(reserved_cores).max(1);

    let pipeline_factor = opts.pipeline_factor.max(1.0);
    let min_workers = opts.min_workers.max(1);
    let target_inflight = ((usable_cores as f64 * pipeline_factor).floor() as usize).max(1);

    let soft_cap = match opts.soft_guard_override {
        Some(guard) => guard.max(min_workers),
        None => {
            let by_cores = (usable_cores as f64 * opts.soft_cap_multiplier).floor() as usize;
            let by_mem = available_bytes
                .filter(|_| opts.per_worker_bytes > 0)
                .map(|avail| ((avail / opts.per_worker_bytes) as usize).max(1));
            let cap = match by_mem {
                Some(mem_cap) => by_cores.min(mem_cap),
                None => by_cores,
            };
            cap.max(min_workers)
        }
    };

    CpuProfile {
        total_cores,
        reserved_cores,
        usable_cores,
        pipeline_factor,
        target_inflight,
        soft_cap,
        min_workers,
        max_workers: soft_cap,
    }
}

fn nvidia_visible_devices_allows_gpu() -> bool {
    match std::env::var("NVIDIA_VISIBLE_DEVICES") {
        Err(_) => true,
        Ok(v) => {
            let v = v.trim().to_ascii_lowercase();
            v != "none"
        }
    }
}

/// Parse `nvidia-smi --query-gpu=name,memory.total` CSV output.
fn parse_smi_output(out: &str) -> Vec<GpuDevice> {
    let mut devices = Vec::new();
    for (index, line) in out.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, mem)) = line.rsplit_once(',') else {
            continue;
        };
        let Ok(mem_mib) = mem.trim().parse::<f64>() else {
            continue;
        };
        devices.push(GpuDevice {
            index,
            name: name.trim().to_string(),
            total_memory_bytes: (mem_mib * 1024.0 * 1024.0) as u64,
        });
    }
    devices
}

/// Probe for NVIDIA GPUs. A failed or empty probe means no GPU; never fatal.
pub fn detect_gpu() -> GpuProfile {
    if !nvidia_visible_devices_allows_gpu() {
        return GpuProfile::default();
    }

    let out = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();
    let devices = match out {
        Ok(out) if out.status.success() => {
            parse_smi_output(&String::from_utf8_lossy(&out.stdout))
        }
        _ => Vec::new(),
    };

    if devices.is_empty() {
        return GpuProfile::default();
    }

    let max_bytes = devices
        .iter()
        .map(|d| d.total_memory_bytes)
        .max()
        .unwrap_or(0);
    let vram_gb = (max_bytes > 0)
        .then(|| (max_bytes as f64 / f64::from(1 << 30) * 100.0).round() / 100.0);

    GpuProfile {
        gpu_present: true,
        gpu_count: devices.len(),
        vram_gb,
        max_gpu_workers: devices.len(),
        devices,
    }
}

/// Enumerate Edge TPU device nodes under `/dev`.
pub fn list_tpu_devices(dev_dir: &Path) -> Vec<String> {
    let mut devices = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dev_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("apex_") {
                devices.push(entry.path().to_string_lossy().into_owned());
            }
        }
    }
    devices.sort();
    devices
}

/// Probe for TPUs. Presence requires proof (a non-empty device list);
/// environment hints alone never claim a TPU.
pub fn detect_tpu(opts: &ProfileOptions) -> TpuProfile {
    if opts.tpu_disabled {
        return TpuProfile::default();
    }

    let devices = list_tpu_devices(Path::new("/dev"));
    if !devices.is_empty() {
        return TpuProfile {
            tpu_present: true,
            tpu_kind: Some(opts.tpu_kind.clone().unwrap_or_else(|| "edgetpu".into())),
            devices,
            max_tpu_workers: 1,
        };
    }

    TpuProfile {
        tpu_present: false,
        tpu_kind: opts.tpu_kind.as_ref().map(|_| "hinted".to_string()),
        devices: Vec::new(),
        max_tpu_workers: 0,
    }
}

/// Combine the sub-profiles, applying TPU-only collapse.
pub fn compose(
    opts: &ProfileOptions,
    mut cpu: CpuProfile,
    mut gpu: GpuProfile,
    tpu: TpuProfile,
) -> WorkerProfile {
    if opts.tpu_only {
        cpu.soft_cap = 1;
        cpu.max_workers = 1;
        cpu.min_workers = 1;
        cpu.target_inflight = 1;
        gpu = GpuProfile::default();
    }

    let max_total_workers = (cpu.soft_cap + gpu.max_gpu_workers + tpu.max_tpu_workers).max(1);

    WorkerProfile {
        cpu,
        gpu,
        tpu,
        workers: WorkerCounts {
            max_total_workers,
            current_workers: 0,
        },
    }
}

/// Build the full profile from the live host.
pub fn build_worker_profile(opts: &ProfileOptions, available_bytes: Option<u64>) -> WorkerProfile {
    let total_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cpu = cpu_profile(opts, total_cores, available_bytes);
    let gpu = detect_gpu();
    let tpu = detect_tpu(opts);
    compose(opts, cpu, gpu, tpu)
}
