//! Accumulate risk metrics over a batch of numeric values.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::args::coerce_f64;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn to_float(v: &Value) -> Result<f64, OpError> {
    coerce_f64(v).ok_or_else(|| OpError::Validation("value must be numeric".into()))
}

fn collect_values(payload: &JsonMap) -> Result<Vec<f64>, OpError> {
    if let Some(raw) = payload.get("values") {
        let raw = raw
            .as_array()
            .ok_or_else(|| OpError::Validation("payload.values must be a list".into()))?;
        return raw.iter().map(to_float).collect();
    }

    if let Some(items) = payload.get("items") {
        let items = items
            .as_array()
            .ok_or_else(|| OpError::Validation("payload.items must be a list".into()))?;
        let field = payload
            .get("field")
            .and_then(Value::as_str)
            .unwrap_or("risk");

        let mut values = Vec::new();
        for item in items {
            let item = item.as_object().ok_or_else(|| {
                OpError::Validation("payload.items must contain dict objects".into())
            })?;
            if let Some(v) = item.get(field) {
                values.push(to_float(v)?);
            }
        }
        return Ok(values);
    }

    Err(OpError::Validation(
        "payload must include either 'values' or 'items'".into(),
    ))
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let start = Instant::now();
    let values = collect_values(&payload)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    if values.is_empty() {
        return Ok(json!({
            "count": 0,
            "sum": 0.0,
            "mean": 0.0,
            "min": Value::Null,
            "max": Value::Null,
            "compute_time_ms": elapsed_ms,
        }));
    }

    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Ok(json!({
        "count": values.len(),
        "sum": sum,
        "mean": sum / values.len() as f64,
        "min": min,
        "max": max,
        "compute_time_ms": elapsed_ms,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<OpContext> {
        Arc::new(OpContext::new(reqwest::Client::new(), None))
    }

    fn payload(v: Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn accumulates_plain_values() {
        let out = run(ctx(), payload(json!({"values": [1, 2.5, "3"]})))
            .await
            .unwrap();
        assert_eq!(out["count"], 3);
        assert_eq!(out["sum"], 6.5);
        assert_eq!(out["min"], 1.0);
        assert_eq!(out["max"], 3.0);
    }

    #[tokio::test]
    async fn extracts_field_from_items() {
        let out = run(
            ctx(),
            payload(json!({
                "items": [{"risk": 0.2}, {"risk": 0.4}, {"other": 9}],
            })),
        )
        .await
        .unwrap();
        assert_eq!(out["count"], 2);
        assert!((out["mean"].as_f64().unwrap() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_input_reports_null_bounds() {
        let out = run(ctx(), payload(json!({"values": []}))).await.unwrap();
        assert_eq!(out["count"], 0);
        assert_eq!(out["min"], Value::Null);
        assert_eq!(out["max"], Value::Null);
    }

    #[tokio::test]
    async fn rejects_missing_shapes_and_bad_values() {
        let err = run(ctx(), JsonMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("'values' or 'items'"));

        let err = run(ctx(), payload(json!({"values": [{}]}))).await.unwrap_err();
        assert!(matches!(err, OpError::Validation(_)));
    }
}
