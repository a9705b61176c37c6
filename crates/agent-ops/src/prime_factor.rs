//! Prime factorization by trial division. Bounded to n <= 1e14 so a single
//! task cannot pin a worker for minutes.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::args::require_int_field;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const MAX_N: i64 = 100_000_000_000_000;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    if n <= 1 {
        return factors;
    }

    while n % 2 == 0 {
        factors.push(2);
        n /= 2;
    }

    let mut f = 3u64;
    let mut limit = n.isqrt();
    while f <= limit && n > 1 {
        while n % f == 0 {
            factors.push(f);
            n /= f;
            limit = n.isqrt();
        }
        f += 2;
    }

    if n > 1 {
        factors.push(n);
    }
    factors
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let n = require_int_field(&payload, "n")?;
    if n < 0 {
        return Err(OpError::Validation("payload.n must be >= 0".into()));
    }
    if n > MAX_N {
        return Err(OpError::Validation("payload.n too large (max 1e14)".into()));
    }

    let start = Instant::now();
    let factors = tokio::task::spawn_blocking(move || prime_factors(n as u64))
        .await
        .map_err(|err| OpError::Runtime(format!("prime_factor task failed: {err}")))?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    Ok(json!({
        "n": n,
        "factors": factors,
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
    fn factors_multiply_back() {
        assert_eq!(prime_factors(0), Vec::<u64>::new());
        assert_eq!(prime_factors(1), Vec::<u64>::new());
        assert_eq!(prime_factors(2), vec![2]);
        assert_eq!(prime_factors(360), vec![2, 2, 2, 3, 3, 5]);
        assert_eq!(prime_factors(97), vec![97]);
        // A semiprime near the limit exercises the isqrt loop.
        assert_eq!(prime_factors(1_000_003 * 2), vec![2, 1_000_003]);
    }

    #[tokio::test]
    async fn requires_n() {
        let err = run(ctx(), JsonMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("payload.n is required"));
    }

    #[tokio::test]
    async fn rejects_out_of_range() {
        let err = run(ctx(), payload(json!({"n": MAX_N + 1}))).await.unwrap_err();
        assert!(matches!(err, OpError::Validation(_)));
    }

    #[tokio::test]
    async fn factors_small_composite() {
        let out = run(ctx(), payload(json!({"n": 12}))).await.unwrap();
        assert_eq!(out["factors"], json!([2, 2, 3]));
    }
}
