//! Extractive text summarization.
//!
//! Scores sentences by word frequency and keeps the best ones in document
//! order until the word budget is met. `max_length`/`min_length` are word
//! counts, mirroring the generation bounds of the model-backed variant this
//! op replaced.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::args::int_field;
use crate::context::OpContext;
use crate::error::OpError;
use crate::{JsonMap, OpHandler};

const DEFAULT_MAX_LENGTH: i64 = 130;
const DEFAULT_MIN_LENGTH: i64 = 30;

pub(crate) fn load(_ctx: &OpContext) -> Result<OpHandler, String> {
    Ok(OpHandler::new(|ctx, payload| Box::pin(run(ctx, payload))))
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

fn words(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn summarize(text: &str, max_words: usize, min_words: usize) -> (String, usize, usize) {
    let sentences = split_sentences(text);

    let mut freq: HashMap<String, usize> = HashMap::new();
    for sentence in &sentences {
        for word in words(sentence) {
            if word.len() >= 3 {
                *freq.entry(word).or_default() += 1;
            }
        }
    }

    let mut scored: Vec<(usize, f64, usize)> = sentences
        .iter()
        .enumerate()
        .map(|(idx, sentence)| {
            let ws = words(sentence);
            let score: usize = ws.iter().filter_map(|w| freq.get(w)).sum();
            let norm = score as f64 / (ws.len().max(1) as f64).sqrt();
            (idx, norm, ws.len())
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<usize> = Vec::new();
    let mut word_budget = 0usize;
    for (idx, _score, len) in &scored {
        if word_budget >= max_words && word_budget >= min_words {
            break;
        }
        if word_budget + len > max_words && word_budget >= min_words {
            continue;
        }
        picked.push(*idx);
        word_budget += len;
    }
    picked.sort_unstable();

    let summary = picked
        .iter()
        .map(|&idx| sentences[idx].as_str())
        .collect::<Vec<_>>()
        .join(" ");
    (summary, picked.len(), sentences.len())
}

async fn run(_ctx: Arc<OpContext>, payload: JsonMap) -> Result<Value, OpError> {
    if payload.is_empty() {
        return Ok(json!({ "ok": false, "error": "empty payload" }));
    }

    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if text.is_empty() {
        return Ok(json!({ "ok": false, "error": "no text provided" }));
    }

    let max_length = int_field(&payload, "max_length")?
        .unwrap_or(DEFAULT_MAX_LENGTH)
        .max(1) as usize;
    let min_length = int_field(&payload, "min_length")?
        .unwrap_or(DEFAULT_MIN_LENGTH)
        .max(0) as usize;

    let (summary, selected, total) =
        tokio::task::spawn_blocking(move || summarize(&text, max_length, min_length))
            .await
            .map_err(|err| OpError::Runtime(format!("map_summarize task failed: {err}")))?;

    Ok(json!({
        "ok": true,
        "summary": summary,
        "sentences_selected": selected,
        "sentences_total": total,
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
    fn splits_on_terminal_punctuation() {
        let s = split_sentences("One. Two! Three? Trailing");
        assert_eq!(s.len(), 4);
        assert_eq!(s[3], "Trailing");
    }

    #[test]
    fn summary_keeps_document_order() {
        let text = "The fabric schedules tasks. Bananas are yellow. \
                    The fabric leases tasks to agents. The fabric posts task results.";
        let (summary, selected, total) = summarize(text, 12, 0);
        assert_eq!(total, 4);
        assert!(selected < total);
        // Selected sentences appear in their original order.
        if let (Some(a), Some(b)) = (summary.find("leases"), summary.find("results")) {
            assert!(a < b);
        }
    }

    #[tokio::test]
    async fn soft_errors_for_empty_inputs() {
        let out = run(ctx(), JsonMap::new()).await.unwrap();
        assert_eq!(out["ok"], false);
        assert_eq!(out["error"], "empty payload");

        let out = run(ctx(), payload(json!({"text": "   "}))).await.unwrap();
        assert_eq!(out["ok"], false);
        assert_eq!(out["error"], "no text provided");
    }

    #[tokio::test]
    async fn summarizes_short_text() {
        let out = run(
            ctx(),
            payload(json!({"text": "Agents lease ops. Agents run ops. Agents post results."})),
        )
        .await
        .unwrap();
        assert_eq!(out["ok"], true);
        assert!(!out["summary"].as_str().unwrap().is_empty());
        assert_eq!(out["sentences_total"], 3);
    }
}
