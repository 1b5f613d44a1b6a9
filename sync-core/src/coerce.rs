//! Value coercion against checked data types.

use chrono::{DateTime, NaiveDate};
use serde_json::{Number, Value};
use tessel_sync_types::{Attribute, DataType};

use crate::error::ValidationError;

/// Coerce a value written to `attr`, or explain why it does not fit.
pub fn coerce_value(attr: &Attribute, value: Value) -> Result<Value, ValidationError> {
    let etype = &attr.forward_identity.etype;
    let label = &attr.forward_identity.label;

    if value.is_null() {
        if attr.required {
            return Err(ValidationError::Required {
                etype: etype.clone(),
                label: label.clone(),
            });
        }
        return Ok(Value::Null);
    }

    let Some(data_type) = attr.checked_data_type else {
        return Ok(value);
    };
    coerce_to(data_type, &value).ok_or_else(|| ValidationError::TypeMismatch {
        etype: etype.clone(),
        label: label.clone(),
        expected: data_type,
        value: value.to_string(),
    })
}

/// Coerce a non-null value to a data type.
pub fn coerce_to(data_type: DataType, value: &Value) -> Option<Value> {
    match data_type {
        DataType::Json => Some(value.clone()),
        DataType::String => value.is_string().then(|| value.clone()),
        DataType::Boolean => value.is_boolean().then(|| value.clone()),
        DataType::Number => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => parse_number(s.trim()),
            _ => None,
        },
        DataType::Date => date_millis(value).map(Value::from),
    }
}

/// Normalize a date to epoch milliseconds.
///
/// Accepts epoch-millis numbers, RFC 3339 timestamps and `YYYY-MM-DD` dates
/// (midnight UTC).
pub fn date_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
