//! Trivial diagnostic op: returns the payload back so controller ↔ agent
//! plumbing can be tested end to end.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    Ok(json!({ "ok": true, "echo": Value::Object(payload) }))
}
