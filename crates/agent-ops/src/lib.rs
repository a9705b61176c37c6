#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Op registry and handlers for the fabric agent.
//!
//! An op is a named function from a JSON payload to a JSON result. The
//! [`registry::Registry`] owns the allow-list, the `TASKS` gating, lazy
//! handler loading and the dispatch path that turns every handler failure
//! into a structured error instead of a crash.

pub mod context;
pub mod error;
pub mod registry;

mod args;
mod classify_tpu;
mod csv_shard;
mod echo;
mod fibonacci;
mod prime_factor;
mod risk;
mod sat_verify;
mod subset_sum;
mod summarize;
mod tokenize;
pub mod tpu;
mod webhook;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::OpContext;
use crate::error::OpError;

/// JSON object payload handed to every handler.
pub type JsonMap = serde_json::Map<String, Value>;

/// Boxed handler future.
pub type OpFuture = Pin<Box<dyn Future<Output = Result<Value, OpError>> + Send + 'static>>;

/// A registered op handler.
#[derive(Clone)]
pub struct OpHandler(Arc<dyn Fn(Arc<OpContext>, JsonMap) -> OpFuture + Send + Sync>);

impl OpHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Arc<OpContext>, JsonMap) -> OpFuture + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, ctx: Arc<OpContext>, payload: JsonMap) -> OpFuture {
        (self.0)(ctx, payload)
    }
}

impl std::fmt::Debug for OpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpHandler")
    }
}
