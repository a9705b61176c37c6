//! Parsing for the `AGENT_LABELS` tag list (`k=v,k2=v2`).

use serde_json::{Map, Value};

/// Parse a comma-separated `k=v` list into a JSON object.
///
/// A bare token without `=` becomes a boolean `true` tag. Empty segments and
/// surrounding whitespace are ignored.
pub fn parse_labels(raw: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                out.insert(k.trim().to_string(), Value::String(v.trim().to_string()));
            }
            None => {
                out.insert(part.to_string(), Value::Bool(true));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_flags() {
        let labels = parse_labels("zone=eu-1, tier=lite ,gpu");
        assert_eq!(labels.get("zone"), Some(&Value::String("eu-1".into())));
        assert_eq!(labels.get("tier"), Some(&Value::String("lite".into())));
        assert_eq!(labels.get("gpu"), Some(&Value::Bool(true)));
    }

    #[test]
    fn empty_input_yields_no_labels() {
        assert!(parse_labels("").is_empty());
        assert!(parse_labels(" , ,").is_empty());
    }

    #[test]
    fn value_may_contain_equals() {
        let labels = parse_labels("note=a=b");
        assert_eq!(labels.get("note"), Some(&Value::String("a=b".into())));
    }
}
