//! Pseudo-polynomial subset-sum solver with witness reconstruction.
//!
//! The DP is O(n * target), so both dimensions are bounded before any work
//! starts.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};

use crate::args::{coerce_i64, require_int_field};
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const MAX_TARGET: i64 = 200_000;
const MAX_NUMS: usize = 20_000;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

struct DpOutcome {
    solvable: bool,
    witness: Vec<u64>,
}

fn subset_sum_dp(nums: &[u64], target: usize) -> DpOutcome {
    // used[t] = index of the number that first reached sum t.
    let mut used: Vec<Option<usize>> = vec![None; target + 1];
    let mut parent: Vec<usize> = vec![0; target + 1];
    let mut reachable = vec![false; target + 1];
    reachable[0] = true;

    for (i, &x) in nums.iter().enumerate() {
        let x = x as usize;
        if x > target {
            continue;
        }
        // Backwards so each number is used at most once.
        for t in (x..=target).rev() {
            if !reachable[t] && reachable[t - x] {
                reachable[t] = true;
                used[t] = Some(i);
                parent[t] = t - x;
            }
        }
    }

    let solvable = reachable[target];
    let mut witness = Vec::new();
    if solvable {
        let mut t = target;
        while t != 0 {
            let Some(idx) = used[t] else { break };
            witness.push(nums[idx]);
            t = parent[t];
        }
        witness.reverse();
    }

    DpOutcome { solvable, witness }
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let raw_nums = payload
        .get("nums")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            OpError::Validation("payload.nums must be a list of numbers (ints preferred)".into())
        })?;

    let mut nums = Vec::with_capacity(raw_nums.len());
    for v in raw_nums {
        let n = coerce_i64(v).ok_or_else(|| {
            OpError::Validation("payload.nums must contain only int-coercible values".into())
        })?;
        if n < 0 {
            return Err(OpError::Validation(
                "payload.nums must be non-negative for this DP implementation".into(),
            ));
        }
        nums.push(n as u64);
    }

    let target = require_int_field(&payload, "target")?;
    if target < 0 {
        return Err(OpError::Validation("payload.target must be >= 0".into()));
    }
    if target > MAX_TARGET {
        return Err(OpError::Validation(format!(
            "payload.target too large (max {MAX_TARGET})"
        )));
    }
    if nums.len() > MAX_NUMS {
        return Err(OpError::Validation(format!(
            "payload.nums too long (max {MAX_NUMS} items)"
        )));
    }

    let start = Instant::now();
    let n = nums.len();
    let target = target as usize;
    let out = tokio::task::spawn_blocking(move || subset_sum_dp(&nums, target))
        .await
        .map_err(|err| OpError::Runtime(format!("subset_sum task failed: {err}")))?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    Ok(json!({
        "solvable": out.solvable,
        "witness": out.witness,
        "target": target,
        "n": n,
        "compute_time_ms": elapsed_ms,
    }))
}
