//! Edge TPU runtime: device proof, model cache and serialized inference.
//!
//! The handle is acquired lazily on first use and cached per model path.
//! Acquisition requires a non-empty device enumeration; configuration hints
//! never stand in for hardware. One inference runs at a time process-wide:
//! the device context is not safe for concurrent submission, so the handle
//! holds a mutex across every invocation.
//!
//! Model format: a compact quantized linear classifier —
//! `"QLC1"` magic, u32 class count, u32 input length, f32 scale, i32
//! zero-point (all little-endian), then `classes * input_len` i8 weights,
//! row-major by class.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use fabric_agent_core::profile::list_tpu_devices;

const MODEL_MAGIC: &[u8; 4] = b"QLC1";
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4;

#[derive(Debug, thiserror::Error)]
pub enum TpuError {
    #[error("no Edge TPU detected (device enumeration returned empty)")]
    NoDevice,
    #[error("TPU model not found: {0}")]
    ModelNotFound(String),
    #[error("TPU model unreadable: {0}")]
    ModelRead(String),
    #[error("TPU model malformed: {0}")]
    ModelFormat(String),
    #[error("input size mismatch: got {got}, expected {expected}")]
    InputSize { got: usize, expected: usize },
}

/// One class with its dequantized score, ordered best-first.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ScoredClass {
    pub index: usize,
    pub score: f32,
}

/// Parsed quantized linear classifier.
#[derive(Debug)]
pub struct ClassifierModel {
    classes: usize,
    input_len: usize,
    scale: f32,
    zero_point: i32,
    weights: Vec<i8>,
}

impl ClassifierModel {
    pub fn parse(bytes: &[u8]) -> Result<Self, TpuError> {
        if bytes.len() < HEADER_LEN {
            return Err(TpuError::ModelFormat("file shorter than header".into()));
        }
        if &bytes[0..4] != MODEL_MAGIC {
            return Err(TpuError::ModelFormat("bad magic (expected QLC1)".into()));
        }
        let classes = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let input_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let scale = f32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let zero_point = i32::from_le_bytes(bytes[16..20].try_into().unwrap());

        if classes == 0 || input_len == 0 {
            return Err(TpuError::ModelFormat("empty class or input dimension".into()));
        }
        let expected = classes
            .checked_mul(input_len)
            .ok_or_else(|| TpuError::ModelFormat("dimension overflow".into()))?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != expected {
            return Err(TpuError::ModelFormat(format!(
                "weight block is {} bytes, expected {expected}",
                body.len()
            )));
        }

        Ok(Self {
            classes,
            input_len,
            scale,
            zero_point,
            weights: body.iter().map(|&b| b as i8).collect(),
        })
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    fn scores(&self, input: &[i8]) -> Vec<f32> {
        (0..self.classes)
            .map(|c| {
                let row = &self.weights[c * self.input_len..(c + 1) * self.input_len];
                let acc: i64 = row
                    .iter()
                    .zip(input)
                    .map(|(&w, &x)| (i64::from(w) - i64::from(self.zero_point)) * i64::from(x))
                    .sum();
                acc as f32 * self.scale
            })
            .collect()
    }
}

/// An acquired device + model pair.
#[derive(Debug)]
pub struct TpuHandle {
    pub model_path: String,
    pub device: String,
    model: ClassifierModel,
    infer_lock: tokio::sync::Mutex<()>,
}

impl TpuHandle {
    fn new(model_path: String, device: String, model: ClassifierModel) -> Self {
        Self {
            model_path,
            device,
            model,
            infer_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one inference. Held mutex serializes all invocations.
    pub async fn classify(&self, input: &[i8], k: usize) -> Result<Vec<ScoredClass>, TpuError> {
        let _guard = self.infer_lock.lock().await;

        if input.len() != self.model.input_len {
            return Err(TpuError::InputSize {
                got: input.len(),
                expected: self.model.input_len,
            });
        }

        let scores = self.model.scores(input);
        let k = k.clamp(1, scores.len());
        let mut ranked: Vec<ScoredClass> = scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| ScoredClass { index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        Ok(ranked)
    }
}

/// Process-wide handle cache, keyed by model path. A new path replaces the
/// cached handle, mirroring the single-interpreter device budget.
#[derive(Debug, Default)]
pub struct TpuRuntime {
    cached: tokio::sync::Mutex<Option<Arc<TpuHandle>>>,
}

impl TpuRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the handle for `model_path`, reusing the cached one when the
    /// path matches. Fails without proof of a device.
    pub async fn acquire(&self, model_path: &str) -> Result<Arc<TpuHandle>, TpuError> {
        let devices = list_tpu_devices(Path::new("/dev"));
        self.acquire_with(&devices, model_path).await
    }

    pub(crate) async fn acquire_with(
        &self,
        devices: &[String],
        model_path: &str,
    ) -> Result<Arc<TpuHandle>, TpuError> {
        let mut cached = self.cached.lock().await;
        if let Some(handle) = cached.as_ref() {
            if handle.model_path == model_path {
                return Ok(handle.clone());
            }
        }

        let Some(device) = devices.first() else {
            return Err(TpuError::NoDevice);
        };

        let path = Path::new(model_path);
        if !path.exists() {
            return Err(TpuError::ModelNotFound(model_path.to_string()));
        }
        let bytes =
            std::fs::read(path).map_err(|err| TpuError::ModelRead(err.to_string()))?;
        let model = ClassifierModel::parse(&bytes)?;

        let handle = Arc::new(TpuHandle::new(
            model_path.to_string(),
            device.clone(),
            model,
        ));
        *cached = Some(handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
pub(crate) fn model_bytes(classes: u32, input_len: u32, scale: f32, zero_point: i32, weights: &[i8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MODEL_MAGIC);
    out.extend_from_slice(&classes.to_le_bytes());
    out.extend_from_slice(&input_len.to_le_bytes());
    out.extend_from_slice(&scale.to_le_bytes());
    out.extend_from_slice(&zero_point.to_le_bytes());
    out.extend(weights.iter().map(|&w| w as u8));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_rejects_bad_models() {
        assert!(matches!(
            ClassifierModel::parse(b"tiny"),
            Err(TpuError::ModelFormat(_))
        ));
        let mut bad_magic = model_bytes(1, 1, 1.0, 0, &[1]);
        bad_magic[0] = b'X';
        assert!(matches!(
            ClassifierModel::parse(&bad_magic),
            Err(TpuError::ModelFormat(_))
        ));
        let truncated = model_bytes(2, 3, 1.0, 0, &[1, 2, 3]);
        assert!(matches!(
            ClassifierModel::parse(&truncated),
            Err(TpuError::ModelFormat(_))
        ));
    }

    #[tokio::test]
    async fn classify_ranks_classes_by_score() {
        let bytes = model_bytes(2, 3, 1.0, 0, &[1, 0, 0, 0, 1, 0]);
        let model = ClassifierModel::parse(&bytes).unwrap();
        let handle = TpuHandle::new("m".into(), "/dev/apex_0".into(), model);

        let top = handle.classify(&[10, 20, 0], 5).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].index, 1);
        assert_eq!(top[0].score, 20.0);
        assert_eq!(top[1].index, 0);
    }

    #[tokio::test]
    async fn classify_applies_scale_and_zero_point() {
        let bytes = model_bytes(1, 2, 0.5, 1, &[3, 3]);
        let model = ClassifierModel::parse(&bytes).unwrap();
        let handle = TpuHandle::new("m".into(), "/dev/apex_0".into(), model);

        // (3-1)*4 + (3-1)*4 = 16, scaled by 0.5.
        let top = handle.classify(&[4, 4], 1).await.unwrap();
        assert_eq!(top[0].score, 8.0);
    }

    #[tokio::test]
    async fn classify_checks_input_size() {
        let bytes = model_bytes(1, 3, 1.0, 0, &[1, 1, 1]);
        let model = ClassifierModel::parse(&bytes).unwrap();
        let handle = TpuHandle::new("m".into(), "/dev/apex_0".into(), model);
        assert!(matches!(
            handle.classify(&[1], 1).await,
            Err(TpuError::InputSize { got: 1, expected: 3 })
        ));
    }

    #[tokio::test]
    async fn acquire_requires_device_proof() {
        let runtime = TpuRuntime::new();
        let err = runtime.acquire_with(&[], "/models/m.qlc").await.unwrap_err();
        assert!(matches!(err, TpuError::NoDevice));
    }

    #[tokio::test]
    async fn acquire_caches_by_model_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&model_bytes(1, 1, 1.0, 0, &[1])).unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let devices = vec!["/dev/apex_0".to_string()];

        let runtime = TpuRuntime::new();
        let first = runtime.acquire_with(&devices, &path).await.unwrap();
        let second = runtime.acquire_with(&devices, &path).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn acquire_reports_missing_model() {
        let runtime = TpuRuntime::new();
        let devices = vec!["/dev/apex_0".to_string()];
        let err = runtime
            .acquire_with(&devices, "/definitely/not/a/model.qlc")
            .await
            .unwrap_err();
        assert!(matches!(err, TpuError::ModelNotFound(_)));
    }
}
