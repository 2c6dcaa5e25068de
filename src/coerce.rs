//! Value coercion from loose export values into target column types.
//!
//! Every function here either returns a value the target schema accepts or
//! a [`RowIssue`] naming the field and the raw value, which skips the row.

use casebridge_core::identifiers::RowIssue;
use casebridge_core::models::value_as_i64;
use casebridge_core::records::flex::parse_datetime;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Largest duration accepted for estimates and elapsed times (one year).
pub const MAX_SECONDS: i64 = 366 * 24 * 3600;

/// Whole seconds from a fractional duration. Negative, non-finite or
/// absurdly large values are row errors.
pub fn seconds(field: &'static str, value: Option<f64>) -> Result<Option<i64>, RowIssue> {
    let Some(v) = value else {
        return Ok(None);
    };
    if !v.is_finite() {
        return Err(RowIssue::new(field, v, "not a finite number"));
    }
    if v < 0.0 {
        return Err(RowIssue::new(field, v, "duration can't be negative"));
    }
    let rounded = v.round();
    if rounded > MAX_SECONDS as f64 {
        return Err(RowIssue::new(
            field,
            v,
            format!("duration exceeds {} seconds", MAX_SECONDS),
        ));
    }
    Ok(Some(rounded as i64))
}

pub fn timestamp(value: Option<DateTime<Utc>>) -> Option<i64> {
    value.map(|dt| dt.timestamp())
}

/// Non-empty trimmed text or a row error.
pub fn required_text(field: &'static str, value: &str) -> Result<String, RowIssue> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RowIssue::new(field, "\"\"", "must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// A custom-field value ready to be stored, before option resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Checkbox(bool),
    /// Unix seconds.
    Date(i64),
    /// Raw option references (source ids or names), resolved later.
    Options(Vec<Value>),
    Raw(Value),
}

impl FieldValue {
    /// JSON stored in `case_field_values.value`.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Number(n) => Value::from(*n),
            FieldValue::Checkbox(b) => Value::Bool(*b),
            FieldValue::Date(ts) => Value::from(*ts),
            FieldValue::Options(items) => Value::Array(items.clone()),
            FieldValue::Raw(v) => v.clone(),
        }
    }
}

/// Coerce a raw custom-field value by field type. `Ok(None)` means there is
/// no value to store.
pub fn field_value(field_type: &str, raw: &Value) -> Result<Option<FieldValue>, RowIssue> {
    if raw.is_null() || raw.as_str().map(|s| s.trim().is_empty()).unwrap_or(false) {
        return Ok(None);
    }
    let value = match field_type {
        "text" | "string" | "url" | "link" => match raw {
            Value::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        },
        "integer" => FieldValue::Integer(
            value_as_i64(raw).ok_or_else(|| RowIssue::new("value", raw, "expected an integer"))?,
        ),
        "number" | "float" | "decimal" => {
            let n = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            FieldValue::Number(
                n.filter(|f: &f64| f.is_finite())
                    .ok_or_else(|| RowIssue::new("value", raw, "expected a number"))?,
            )
        }
        "checkbox" | "bool" | "boolean" => FieldValue::Checkbox(match raw {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            _ => return Err(RowIssue::new("value", raw, "expected a boolean")),
        }),
        "date" | "datetime" => {
            let ts = match raw {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => parse_datetime(s)
                    .map(|dt| dt.timestamp())
                    .or_else(|| s.trim().parse().ok()),
                _ => None,
            };
            FieldValue::Date(ts.ok_or_else(|| RowIssue::new("value", raw, "expected a date"))?)
        }
        "dropdown" | "multiselect" => FieldValue::Options(match raw {
            Value::Array(items) => items.clone(),
            Value::String(s) if s.contains(',') => s
                .split(',')
                .map(|part| Value::String(part.trim().to_string()))
                .filter(|v| v.as_str() != Some(""))
                .collect(),
            other => vec![other.clone()],
        }),
        _ => FieldValue::Raw(raw.clone()),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seconds_rounds_and_rejects_negatives() {
        assert_eq!(seconds("elapsed", Some(12.6)).unwrap(), Some(13));
        assert_eq!(seconds("elapsed", None).unwrap(), None);
        let issue = seconds("elapsed", Some(-1.0)).unwrap_err();
        assert_eq!(issue.field, "elapsed");
        assert!(seconds("estimate", Some(f64::INFINITY)).is_err());
        assert!(seconds("estimate", Some(1e12)).is_err());
    }

    #[test]
    fn required_text_trims() {
        assert_eq!(required_text("name", "  Login  ").unwrap(), "Login");
        assert!(required_text("name", "   ").is_err());
    }

    #[test]
    fn field_values_by_type() {
        assert_eq!(
            field_value("integer", &json!("42")).unwrap(),
            Some(FieldValue::Integer(42))
        );
        assert_eq!(
            field_value("checkbox", &json!(1)).unwrap(),
            Some(FieldValue::Checkbox(true))
        );
        assert_eq!(
            field_value("date", &json!("2024-01-02 00:00:00")).unwrap(),
            Some(FieldValue::Date(1704153600))
        );
        assert_eq!(field_value("text", &json!("")).unwrap(), None);
        assert!(field_value("number", &json!("abc")).is_err());
    }

    #[test]
    fn multiselect_accepts_lists_and_csv() {
        assert_eq!(
            field_value("multiselect", &json!("High, Low")).unwrap(),
            Some(FieldValue::Options(vec![json!("High"), json!("Low")]))
        );
        assert_eq!(
            field_value("dropdown", &json!(7)).unwrap(),
            Some(FieldValue::Options(vec![json!(7)]))
        );
    }
}
