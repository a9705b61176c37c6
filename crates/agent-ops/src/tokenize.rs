//! Slice text into fixed-size chunks (default 1 KiB of characters).
//!
//! Accepts either a single `text`/`data` string or an `items` list; list
//! items are stringified leniently so mixed-type batches do not fail the
//! whole task.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::args::coerce_i64;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const DEFAULT_CHUNK_SIZE: usize = 1024;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|c| c.iter().collect())
        .collect()
}

fn stringify(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let chunk_size = match payload.get("chunk_size") {
        None => DEFAULT_CHUNK_SIZE,
        Some(v) => match coerce_i64(v) {
            Some(n) if n > 0 => n as usize,
            _ => {
                return Ok(json!({
                    "ok": false,
                    "error": "payload.chunk_size must be a positive integer",
                }));
            }
        },
    };

    if let Some(items) = payload.get("items").filter(|v| !v.is_null()) {
        let Some(items) = items.as_array() else {
            return Ok(json!({
                "ok": false,
                "error": "payload.items must be a list of strings",
            }));
        };

        let mut all_chunks = Vec::new();
        let mut total_chars = 0usize;
        for item in items {
            let s = stringify(item);
            total_chars += s.chars().count();
            all_chunks.extend(chunk_text(&s, chunk_size));
        }

        return Ok(json!({
            "ok": true,
            "tokens": all_chunks,
            "count": all_chunks.len(),
            "total_chars": total_chars,
            "items_count": items.len(),
        }));
    }

    let text = payload
        .get("text")
        .filter(|v| !v.is_null())
        .or_else(|| payload.get("data"));
    let text = match text {
        None => "",
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Ok(json!({
                "ok": false,
                "error": "payload.text must be a string",
            }));
        }
    };

    let chunks = chunk_text(text, chunk_size);
    Ok(json!({
        "ok": true,
        "tokens": chunks,
        "count": chunks.len(),
        "total_chars": text.chars().count(),
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
    async fn chunks_single_text() {
        let out = run(ctx(), payload(json!({"text": "abcdefgh", "chunk_size": 3})))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["tokens"], json!(["abc", "def", "gh"]));
        assert_eq!(out["count"], 3);
        assert_eq!(out["total_chars"], 8);
    }

    #[tokio::test]
    async fn flattens_item_lists_and_stringifies_loosely() {
        let out = run(
            ctx(),
            payload(json!({"items": ["abcd", null, 12], "chunk_size": 2})),
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["items_count"], 3);
        assert_eq!(out["tokens"], json!(["ab", "cd", "12"]));
    }

    #[tokio::test]
    async fn rejects_bad_chunk_size_softly() {
        let out = run(ctx(), payload(json!({"text": "x", "chunk_size": 0})))
            .await
            .unwrap();
        assert_eq!(out["ok"], false);
    }

    #[tokio::test]
    async fn empty_payload_yields_no_chunks() {
        let out = run(ctx(), JsonMap::new()).await.unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["count"], 0);
    }

    #[tokio::test]
    async fn chunking_respects_char_boundaries() {
        let out = run(ctx(), payload(json!({"text": "héllo wörld", "chunk_size": 4})))
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(out["total_chars"], 11);
    }
}
