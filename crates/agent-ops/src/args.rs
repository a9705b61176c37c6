//! Small payload-field coercion helpers shared by the handlers.
//!
//! The controller's producers are loose about numeric types (ints, floats
//! and numeric strings all occur in the wild), so integer fields accept all
//! three, matching the agent's historical behavior.

use serde_json::Value;

use crate::JsonMap;
use crate::error::OpError;

/// Coerce a JSON value to an integer: integral numbers, truncating floats
/// and trimmed numeric strings are all accepted.
pub(crate) fn coerce_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Coerce a JSON value to a float: numbers and trimmed numeric strings.
pub(crate) fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Read an optional integer field, failing with a readable message when the
/// field is present but not int-coercible.
pub(crate) fn int_field(payload: &JsonMap, key: &str) -> Result<Option<i64>, OpError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => coerce_i64(v)
            .map(Some)
            .ok_or_else(|| OpError::Validation(format!("payload.{key} must be an int"))),
    }
}

/// Read a required integer field.
pub(crate) fn require_int_field(payload: &JsonMap, key: &str) -> Result<i64, OpError> {
    int_field(payload, key)?
        .ok_or_else(|| OpError::Validation(format!("payload.{key} is required")))
}

pub(crate) fn str_field<'a>(payload: &'a JsonMap, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: serde_json::Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn int_field_accepts_numbers_and_strings() {
        let payload = map(json!({"a": 3, "b": "42", "c": 3.9, "d": true}));
        assert_eq!(int_field(&payload, "a").unwrap(), Some(3));
        assert_eq!(int_field(&payload, "b").unwrap(), Some(42));
        assert_eq!(int_field(&payload, "c").unwrap(), Some(3));
        assert!(int_field(&payload, "d").is_err());
        assert_eq!(int_field(&payload, "missing").unwrap(), None);
    }

    #[test]
    fn require_int_field_reports_missing() {
        let payload = map(json!({}));
        let err = require_int_field(&payload, "n").unwrap_err();
        assert!(err.to_string().contains("payload.n is required"));
    }

    #[test]
    fn coerce_f64_handles_strings() {
        assert_eq!(coerce_f64(&json!(" 2.5 ")), Some(2.5));
        assert_eq!(coerce_f64(&json!(7)), Some(7.0));
        assert_eq!(coerce_f64(&json!([])), None);
    }
}
