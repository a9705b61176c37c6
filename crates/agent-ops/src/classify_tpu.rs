//! TPU-backed int8 classification with an explicit CPU fallback sentinel.
//!
//! When the accelerator (or its model) is unavailable and the payload
//! permits it, the op succeeds with `fallback:"cpu"` and an empty `topk`
//! rather than pretending inference ran.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::args::{coerce_i64, int_field};
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const OP_NAME: &str = "map_classify_tpu";
const DEFAULT_MODEL_PATH: &str = "/models/model_edgetpu.qlc";
const DEFAULT_TOPK: i64 = 5;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn parse_input(payload: &JsonMap) -> Result<Vec<i8>, OpError> {
    let input = payload
        .get("input")
        .ok_or_else(|| OpError::Validation("payload missing required key: \"input\"".into()))?;
    let input = input
        .as_array()
        .ok_or_else(|| OpError::Validation("payload.input must be a flat list of int8".into()))?;

    input
        .iter()
        .map(|v| {
            coerce_i64(v)
                .filter(|n| (-128..=127).contains(n))
                .map(|n| n as i8)
                .ok_or_else(|| {
                    OpError::Validation("payload.input values must be int8 (-128..=127)".into())
                })
        })
        .collect()
}

async fn classify(ctx: &OpContext, payload: &JsonMap) -> Result<Value, OpError> {
    let model_path = payload
        .get("model_path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.default_model_path.clone())
        .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string());

    let handle = ctx
        .tpu
        .acquire(&model_path)
        .await
        .map_err(|err| OpError::Accelerator(err.to_string()))?;

    let input = parse_input(payload)?;
    let k = int_field(payload, "topk")?.unwrap_or(DEFAULT_TOPK).max(1) as usize;

    let topk = handle
        .classify(&input, k)
        .await
        .map_err(|err| OpError::Accelerator(err.to_string()))?;

    Ok(json!({
        "op": OP_NAME,
        "model_path": handle.model_path,
        "topk": topk,
    }))
}

async fn run(ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let t0 = Instant::now();
    let allow_fallback = payload
        .get("allow_fallback")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    match classify(&ctx, &payload).await {
        Ok(mut out) => {
            out["elapsed_ms"] = json!(t0.elapsed().as_secs_f64() * 1000.0);
            Ok(out)
        }
        Err(err) if allow_fallback => Ok(json!({
            "op": OP_NAME,
            "fallback": "cpu",
            "reason": err.to_string(),
            "topk": [],
            "elapsed_ms": t0.elapsed().as_secs_f64() * 1000.0,
        })),
        Err(err) => Err(err),
    }
}
