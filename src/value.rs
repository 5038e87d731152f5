use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Sentinel stored when a date field receives input that cannot be parsed.
pub static UNDEFINED_DATE: Lazy<DateTime<Utc>> =
    Lazy::new(|| Utc.with_ymd_and_hms(101, 1, 1, 0, 0, 0).single().expect("sentinel date is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Text,
    Float,
    Date,
    Bool,
}

/// Persisted payload of a one-one field. Rows are bincode-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Text(String),
    Float(f64),
    Date(DateTime<Utc>),
    Bool(bool),
}

/// Caller-side value accepted by `set_field`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldInput {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<String>),
}

impl From<&str> for FieldInput {
    fn from(s: &str) -> Self {
        FieldInput::Text(s.to_string())
    }
}

impl From<String> for FieldInput {
    fn from(s: String) -> Self {
        FieldInput::Text(s)
    }
}

impl From<f64> for FieldInput {
    fn from(n: f64) -> Self {
        FieldInput::Number(n)
    }
}

impl From<bool> for FieldInput {
    fn from(b: bool) -> Self {
        FieldInput::Bool(b)
    }
}

impl From<Vec<&str>> for FieldInput {
    fn from(items: Vec<&str>) -> Self {
        FieldInput::List(items.into_iter().map(|s| s.to_string()).collect())
    }
}

impl<T: Into<FieldInput>> From<Option<T>> for FieldInput {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => FieldInput::Null,
        }
    }
}

/// Read-side value returned by `field_for`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Float(f64),
    Date(DateTime<Utc>),
    Bool(bool),
    Item(String),
    Items(Vec<String>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Item(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&[String]> {
        match self {
            FieldValue::Items(items) => Some(items),
            _ => None,
        }
    }

    /// Rendering used by composite templates and path derivation.
    pub fn display_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Text(s) | FieldValue::Item(s) => s.clone(),
            FieldValue::Float(n) => fmt_float(*n),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Items(items) => items.join(", "),
        }
    }
}

impl From<Scalar> for FieldValue {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Text(v) => FieldValue::Text(v),
            Scalar::Float(v) => FieldValue::Float(v),
            Scalar::Date(v) => FieldValue::Date(v),
            Scalar::Bool(v) => FieldValue::Bool(v),
        }
    }
}

/// Floats print integer-style when they carry no fractional part, so a
/// series index of 3.0 renders as "3" but 3.5 stays "3.5".
pub fn fmt_float(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

/// Coerce caller input into the stored form for a one-one field.
///
/// Malformed input never errors: numeric fields clamp to `default_float`,
/// dates fall back to `UNDEFINED_DATE`, and blank text means absence (an
/// explicit empty string is treated identically to no value).
pub fn coerce_scalar(kind: ScalarKind, input: &FieldInput, default_float: f64) -> Option<Scalar> {
    match kind {
        ScalarKind::Text => match input {
            FieldInput::Null => None,
            FieldInput::Text(s) => {
                if s.trim().is_empty() {
                    None
                } else {
                    Some(Scalar::Text(s.clone()))
                }
            }
            FieldInput::Number(n) => Some(Scalar::Text(fmt_float(*n))),
            FieldInput::Bool(b) => Some(Scalar::Text(b.to_string())),
            FieldInput::List(items) => {
                let joined = items.join(", ");
                if joined.trim().is_empty() {
                    None
                } else {
                    Some(Scalar::Text(joined))
                }
            }
        },
        ScalarKind::Float => match input {
            FieldInput::Null => Some(Scalar::Float(default_float)),
            FieldInput::Number(n) => Some(Scalar::Float(*n)),
            FieldInput::Bool(b) => Some(Scalar::Float(if *b { 1.0 } else { 0.0 })),
            FieldInput::Text(s) => {
                let parsed = s.trim().parse::<f64>().unwrap_or(default_float);
                Some(Scalar::Float(parsed))
            }
            FieldInput::List(_) => Some(Scalar::Float(default_float)),
        },
        ScalarKind::Date => match input {
            FieldInput::Null => None,
            FieldInput::Text(s) => {
                if s.trim().is_empty() {
                    None
                } else {
                    Some(Scalar::Date(parse_date(s.trim()).unwrap_or(*UNDEFINED_DATE)))
                }
            }
            FieldInput::Number(secs) => Some(Scalar::Date(
                DateTime::<Utc>::from_timestamp(*secs as i64, 0).unwrap_or(*UNDEFINED_DATE),
            )),
            _ => Some(Scalar::Date(*UNDEFINED_DATE)),
        },
        ScalarKind::Bool => match input {
            FieldInput::Null => None,
            FieldInput::Bool(b) => Some(Scalar::Bool(*b)),
            FieldInput::Number(n) => Some(Scalar::Bool(*n != 0.0)),
            FieldInput::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Scalar::Bool(true)),
                "false" | "no" | "0" => Some(Scalar::Bool(false)),
                _ => None,
            },
            FieldInput::List(_) => None,
        },
    }
}
