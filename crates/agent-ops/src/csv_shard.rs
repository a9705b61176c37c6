//! Read a slice of data rows from a CSV file.
//!
//! `start_row = 0` means the first row after the header. Shards are
//! half-open windows, so concatenating `(0,k), (k,k), (2k,k), …` until an
//! empty shard reproduces the file row-wise.
//!
//! Like the other ingestion-style ops, bad input produces a soft
//! `{ok:false, error}` result rather than a failed task, so sharded jobs
//! surface per-shard problems in their results stream.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::args::int_field;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const DEFAULT_SHARD_SIZE: i64 = 100;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn soft_error(msg: impl Into<String>) -> Value {
    json!({ "ok": false, "error": msg.into() })
}

fn read_shard(
    source_uri: &str,
    start_row: usize,
    shard_size: usize,
) -> Result<Vec<Map<String, Value>>, String> {
    let mut reader = csv::Reader::from_path(source_uri)
        .map_err(|err| format!("read_csv_shard: failed reading csv: {err}"))?;
    let headers = reader
        .headers()
        .map_err(|err| format!("read_csv_shard: failed reading csv: {err}"))?
        .clone();

    let stop_row = start_row.saturating_add(shard_size);
    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        if idx < start_row {
            continue;
        }
        if idx >= stop_row {
            break;
        }
        let record = record.map_err(|err| format!("read_csv_shard: failed reading csv: {err}"))?;
        let mut row = Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            row.insert(header.to_string(), Value::String(field.to_string()));
        }
        rows.push(row);
    }
    Ok(rows)
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    let dataset_id = payload
        .get("dataset_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown_dataset")
        .to_string();

    let Some(source_uri) = payload.get("source_uri").and_then(Value::as_str) else {
        return Ok(soft_error(
            "read_csv_shard: payload.source_uri (string) is required",
        ));
    };
    let source_uri = source_uri.to_string();

    let (start_row, shard_size) =
        match (int_field(&payload, "start_row"), int_field(&payload, "shard_size")) {
            (Ok(start), Ok(size)) => (start.unwrap_or(0), size.unwrap_or(DEFAULT_SHARD_SIZE)),
            _ => {
                return Ok(soft_error(
                    "read_csv_shard: start_row and shard_size must be integers",
                ));
            }
        };
    if start_row < 0 {
        return Ok(soft_error("read_csv_shard: start_row must be >= 0"));
    }
    if shard_size <= 0 {
        return Ok(soft_error("read_csv_shard: shard_size must be > 0"));
    }

    let mode = payload
        .get("mode")
        .and_then(Value::as_str)
        .unwrap_or("rows");
    if mode != "rows" && mode != "count" {
        return Ok(soft_error("read_csv_shard: mode must be 'rows' or 'count'"));
    }

    if !std::path::Path::new(&source_uri).exists() {
        return Ok(soft_error(format!(
            "read_csv_shard: file not found: {source_uri}"
        )));
    }

    let start = start_row as usize;
    let size = shard_size as usize;
    let read = {
        let source_uri = source_uri.clone();
        tokio::task::spawn_blocking(move || read_shard(&source_uri, start, size))
            .await
            .map_err(|err| OpError::Runtime(format!("read_csv_shard task failed: {err}")))?
    };

    let rows = match read {
        Ok(rows) => rows,
        Err(msg) => return Ok(soft_error(msg)),
    };

    let end_row = start_row + rows.len() as i64;
    let mut out = json!({
        "ok": true,
        "dataset_id": dataset_id,
        "mode": mode,
        "start_row": start_row,
        "end_row": end_row,
        "row_count": rows.len(),
    });
    if mode == "rows" {
        out["rows"] = Value::Array(rows.into_iter().map(Value::Object).collect());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> Arc<OpContext> {
        Arc::new(OpContext::new(reqwest::Client::new(), None))
    }

    fn payload(v: Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    fn csv_file(rows: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b").unwrap();
        for i in 1..=rows {
            writeln!(file, "{i},row{i}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn middle_shard_maps_to_source_rows() {
        let file = csv_file(10);
        let out = run(
            ctx(),
            payload(json!({
                "source_uri": file.path(),
                "start_row": 3,
                "shard_size": 4,
            })),
        )
        .await
        .unwrap();

        assert_eq!(out["ok"], true);
        assert_eq!(out["row_count"], 4);
        assert_eq!(out["start_row"], 3);
        assert_eq!(out["end_row"], 7);
        let rows = out["rows"].as_array().unwrap();
        assert_eq!(rows[0]["a"], "4");
        assert_eq!(rows[3]["a"], "7");
    }

    #[tokio::test]
    async fn shard_past_the_end_is_truncated() {
        let file = csv_file(5);
        let out = run(
            ctx(),
            payload(json!({
                "source_uri": file.path(),
                "start_row": 4,
                "shard_size": 10,
            })),
        )
        .await
        .unwrap();
        assert_eq!(out["row_count"], 1);
        assert_eq!(out["end_row"], 5);

        let out = run(
            ctx(),
            payload(json!({
                "source_uri": file.path(),
                "start_row": 99,
                "shard_size": 10,
            })),
        )
        .await
        .unwrap();
        assert_eq!(out["row_count"], 0);
    }

    #[tokio::test]
    async fn concatenated_shards_reproduce_the_file() {
        let file = csv_file(10);
        let mut seen = Vec::new();
        let mut start = 0;
        loop {
            let out = run(
                ctx(),
                payload(json!({
                    "source_uri": file.path(),
                    "start_row": start,
                    "shard_size": 3,
                })),
            )
            .await
            .unwrap();
            let rows = out["rows"].as_array().unwrap();
            if rows.is_empty() {
                break;
            }
            seen.extend(rows.iter().map(|r| r["a"].as_str().unwrap().to_string()));
            start += 3;
        }
        let expected: Vec<String> = (1..=10).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn count_mode_omits_rows() {
        let file = csv_file(4);
        let out = run(
            ctx(),
            payload(json!({
                "source_uri": file.path(),
                "mode": "count",
            })),
        )
        .await
        .unwrap();
        assert_eq!(out["row_count"], 4);
        assert!(out.get("rows").is_none());
    }

    #[tokio::test]
    async fn soft_errors_for_bad_inputs() {
        let out = run(ctx(), JsonMap::new()).await.unwrap();
        assert_eq!(out["ok"], false);

        let file = csv_file(1);
        let out = run(
            ctx(),
            payload(json!({"source_uri": file.path(), "start_row": -1})),
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], false);

        let out = run(
            ctx(),
            payload(json!({"source_uri": "/definitely/not/here.csv"})),
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().contains("file not found"));
    }
}
