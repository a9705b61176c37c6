//! Fibonacci op. CPU-bound; the value is returned as a decimal string
//! because F(50000) has ~10k digits and JSON numbers cannot carry it.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::args::int_field;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const MAX_N: i64 = 50_000;
const DEFAULT_N: i64 = 30;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

/// Arbitrary-precision addition over base-1e9 limbs, little-endian.
fn limb_add(a: &[u64], b: &[u64]) -> Vec<u64> {
    const BASE: u64 = 1_000_000_000;
    let mut out = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0u64;
    for i in 0..a.len().max(b.len()) {
        let sum = a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0) + carry;
        out.push(sum % BASE);
        carry = sum / BASE;
    }
    if carry > 0 {
        out.push(carry);
    }
    out
}

fn limbs_to_decimal(limbs: &[u64]) -> String {
    let mut iter = limbs.iter().rev();
    let Some(top) = iter.next() else {
        return "0".to_string();
    };
    let mut out = top.to_string();
    for limb in iter {
        out.push_str(&format!("{limb:09}"));
    }
    out
}

fn fib_decimal(n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut a: Vec<u64> = vec![0];
    let mut b: Vec<u64> = vec![1];
    for _ in 2..=n {
        let next = limb_add(&a, &b);
        a = b;
        b = next;
    }
    limbs_to_decimal(&b)
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let n = int_field(&payload, "n")?.unwrap_or(DEFAULT_N);
    if n < 0 {
        return Err(OpError::Validation("payload.n must be >= 0".into()));
    }
    if n > MAX_N {
        return Err(OpError::Validation(format!(
            "payload.n too large (max {MAX_N})"
        )));
    }

    let start = Instant::now();
    let result = tokio::task::spawn_blocking(move || fib_decimal(n as u64))
        .await
        .map_err(|err| OpError::Runtime(format!("fibonacci task failed: {err}")))?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    Ok(json!({
        "n": n,
        "result": result,
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

    #[test]
    fn small_values_match_the_sequence() {
        let expected = ["0", "1", "1", "2", "3", "5", "8", "13", "21", "34", "55"];
        for (n, want) in expected.iter().enumerate() {
            assert_eq!(fib_decimal(n as u64), *want, "F({n})");
        }
    }

    #[test]
    fn hundredth_value_is_exact() {
        assert_eq!(fib_decimal(100), "354224848179261915075");
    }

    #[test]
    fn limb_carry_propagates() {
        assert_eq!(
            limbs_to_decimal(&limb_add(&[999_999_999], &[1])),
            "1000000000"
        );
    }

    #[tokio::test]
    async fn boundary_zero_and_one() {
        let out = run(ctx(), payload(json!({"n": 0}))).await.unwrap();
        assert_eq!(out["result"], "0");
        let out = run(ctx(), payload(json!({"n": 1}))).await.unwrap();
        assert_eq!(out["result"], "1");
    }

    #[tokio::test]
    async fn rejects_out_of_range_inputs() {
        let err = run(ctx(), payload(json!({"n": -1}))).await.unwrap_err();
        assert!(matches!(err, OpError::Validation(_)));
        let err = run(ctx(), payload(json!({"n": 50_001}))).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
        let err = run(ctx(), payload(json!({"n": "abc"}))).await.unwrap_err();
        assert!(matches!(err, OpError::Validation(_)));
    }

    #[tokio::test]
    async fn upper_boundary_is_accepted() {
        let out = run(ctx(), payload(json!({"n": MAX_N}))).await.unwrap();
        let digits = out["result"].as_str().unwrap();
        // F(50000) has 10450 decimal digits.
        assert_eq!(digits.len(), 10450);
        assert!(digits.starts_with('1'));
    }

    #[tokio::test]
    async fn defaults_to_n_30() {
        let out = run(ctx(), JsonMap::new()).await.unwrap();
        assert_eq!(out["n"], 30);
        assert_eq!(out["result"], "832040");
    }
}
