//! Verify CNF satisfaction for a proposed assignment.
//!
//! Variables not covered by `assignment_bits` evaluate to false, so a
//! truncated assignment can still be checked.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::args::{coerce_i64, str_field};
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn lit_value(lit: i64, bits: &[u8]) -> bool {
    let var = lit.unsigned_abs() as usize;
    if var == 0 || var > bits.len() {
        return false;
    }
    let var_true = bits[var - 1] == b'1';
    if lit > 0 { var_true } else { !var_true }
}

fn parse_cnf(payload: &JsonMap) -> Result<Vec<Vec<i64>>, OpError> {
    let cnf = payload
        .get("cnf")
        .and_then(Value::as_array)
        .ok_or_else(|| OpError::Validation("cnf must be a list of clauses (list[list[int]])".into()))?;

    let mut out = Vec::with_capacity(cnf.len());
    for clause in cnf {
        let clause = clause.as_array().ok_or_else(|| {
            OpError::Validation("cnf must be a list of clauses (list[list[int]])".into())
        })?;
        let mut lits = Vec::with_capacity(clause.len());
        for lit in clause {
            lits.push(
                coerce_i64(lit)
                    .ok_or_else(|| OpError::Validation("cnf literals must be ints".into()))?,
            );
        }
        out.push(lits);
    }
    Ok(out)
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let bits = str_field(&payload, "assignment_bits")
        .ok_or_else(|| OpError::Validation("assignment_bits must be a string of 0/1".into()))?;
    if bits.bytes().any(|b| b != b'0' && b != b'1') {
        return Err(OpError::Validation(
            "assignment_bits must be a string of 0/1".into(),
        ));
    }
    let bits = bits.as_bytes().to_vec();

    let cnf = parse_cnf(&payload)?;

    let max_var = cnf
        .iter()
        .flatten()
        .map(|lit| lit.unsigned_abs())
        .max()
        .unwrap_or(0);

    for (idx, clause) in cnf.iter().enumerate() {
        if !clause.iter().any(|&lit| lit_value(lit, &bits)) {
            return Ok(json!({
                "sat": false,
                "unsat_clause": idx,
                "nvars": max_var,
                "nclauses": cnf.len(),
            }));
        }
    }

    Ok(json!({
        "sat": true,
        "unsat_clause": Value::Null,
        "nvars": max_var,
        "nclauses": cnf.len(),
    }))
}
