//! Canonical type system (C2).
//!
//! Every value on the wire is a string; `Schema` drives typed
//! interpretation. All value operations route through [`TypedValue`] so
//! that no code outside this module branches on raw strings, per the
//! design notes' "single typed-value variant" guidance.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TdtpError};

/// The canonical field type set, after alias normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Real,
    Decimal,
    Text,
    Boolean,
    Date,
    DateTime,
    Timestamp,
    Blob,
}

impl FieldType {
    /// Normalizes a raw type token (from wire or config) to the canonical set.
    ///
    /// `int -> integer`, `float/double -> real`, `varchar/char/string -> text`,
    /// `bool -> boolean`; anything else must already be canonical.
    pub fn parse(raw: &str) -> Result<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        Ok(match lower.as_str() {
            "integer" | "int" | "int64" | "bigint" => FieldType::Integer,
            "real" | "float" | "double" | "float64" => FieldType::Real,
            "decimal" | "numeric" => FieldType::Decimal,
            "text" | "varchar" | "char" | "string" => FieldType::Text,
            "boolean" | "bool" => FieldType::Boolean,
            "date" => FieldType::Date,
            "datetime" => FieldType::DateTime,
            "timestamp" => FieldType::Timestamp,
            "blob" | "binary" | "bytea" => FieldType::Blob,
            other => {
                return Err(TdtpError::validation(format!("unknown field type: {other}")))
            }
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Decimal => "decimal",
            FieldType::Text => "text",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Timestamp => "timestamp",
            FieldType::Blob => "blob",
        }
    }
}

/// A single interpreted field value.
///
/// Carries the typed slot plus the original raw string so re-emission can
/// be lossless even for values the codec never had to reinterpret.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Integer(i64),
    Real(f64),
    /// Decimal is kept as its formatted string plus the parsed precision/scale
    /// actually present, since `f64` cannot represent arbitrary precision losslessly.
    Decimal { raw: String, scale: u32 },
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(chrono::NaiveDateTime),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            TypedValue::Null => None,
            TypedValue::Integer(_) => Some(FieldType::Integer),
            TypedValue::Real(_) => Some(FieldType::Real),
            TypedValue::Decimal { .. } => Some(FieldType::Decimal),
            TypedValue::Text(_) => Some(FieldType::Text),
            TypedValue::Boolean(_) => Some(FieldType::Boolean),
            TypedValue::Date(_) => Some(FieldType::Date),
            TypedValue::DateTime(_) => Some(FieldType::DateTime),
            TypedValue::Timestamp(_) => Some(FieldType::Timestamp),
            TypedValue::Blob(_) => Some(FieldType::Blob),
        }
    }
}

/// Field-level constraints consulted while parsing/validating a value.
#[derive(Debug, Clone)]
pub struct ValueConstraints {
    pub field_type: FieldType,
    /// `0` or negative means unbounded (native TEXT/VARCHAR(MAX)).
    pub length: Option<i64>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// Parses a raw wire string into a [`TypedValue`] per the field's declared type.
///
/// Empty string is treated as NULL for every type except `text`, where an
/// empty string is a valid (non-null) value — the wire format has no
/// separate null sentinel, so this is the documented convention.
pub fn parse_value(raw: &str, constraints: &ValueConstraints) -> Result<TypedValue> {
    if raw.is_empty() && constraints.field_type != FieldType::Text {
        return Ok(TypedValue::Null);
    }
    match constraints.field_type {
        FieldType::Integer => raw
            .parse::<i64>()
            .map(TypedValue::Integer)
            .map_err(|e| TdtpError::validation(format!("invalid integer '{raw}': {e}"))),
        FieldType::Real => raw
            .parse::<f64>()
            .map(TypedValue::Real)
            .map_err(|e| TdtpError::validation(format!("invalid real '{raw}': {e}"))),
        FieldType::Decimal => {
            let precision = constraints.precision.unwrap_or(0);
            if precision == 0 {
                return Err(TdtpError::validation("decimal field missing precision"));
            }
            let scale = constraints.scale.unwrap_or(0);
            validate_decimal_literal(raw, precision, scale)?;
            let actual_scale = raw
                .split_once('.')
                .map(|(_, frac)| frac.len() as u32)
                .unwrap_or(0);
            Ok(TypedValue::Decimal {
                raw: raw.to_string(),
                scale: actual_scale,
            })
        }
        FieldType::Text => {
            if let Some(len) = constraints.length {
                if len > 0 && raw.chars().count() as i64 > len {
                    return Err(TdtpError::validation(format!(
                        "text value exceeds declared length {len}"
                    )));
                }
            }
            Ok(TypedValue::Text(raw.to_string()))
        }
        FieldType::Boolean => match raw {
            "1" => Ok(TypedValue::Boolean(true)),
            "0" => Ok(TypedValue::Boolean(false)),
            other => Err(TdtpError::validation(format!(
                "boolean must be '1' or '0', got '{other}'"
            ))),
        },
        FieldType::Date => parse_date(raw),
        FieldType::DateTime => parse_datetime(raw),
        FieldType::Timestamp => parse_timestamp(raw),
        FieldType::Blob => decode_blob(raw),
    }
}

fn validate_decimal_literal(raw: &str, precision: u32, scale: u32) -> Result<()> {
    if scale > precision {
        return Err(TdtpError::validation("decimal scale cannot exceed precision"));
    }
    let unsigned = raw.strip_prefix('-').unwrap_or(raw);
    let digits: String = unsigned.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(TdtpError::validation(format!("invalid decimal literal '{raw}'")));
    }
    if digits.len() as u32 > precision {
        return Err(TdtpError::validation(format!(
            "decimal '{raw}' exceeds precision {precision}"
        )));
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<TypedValue> {
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(TypedValue::Date(d));
    }
    // Accept any RFC-3339-prefixed form; discard the time component.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(TypedValue::Date(dt.date_naive()));
    }
    Err(TdtpError::validation(format!("invalid date '{raw}'")))
}

fn parse_datetime(raw: &str) -> Result<TypedValue> {
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(TypedValue::DateTime(dt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(TypedValue::DateTime(dt.naive_utc()));
    }
    Err(TdtpError::validation(format!("invalid datetime '{raw}'")))
}

fn parse_timestamp(raw: &str) -> Result<TypedValue> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| TypedValue::Timestamp(dt.with_timezone(&Utc)))
        .map_err(|e| TdtpError::validation(format!("invalid timestamp '{raw}': {e}")))
}

fn decode_blob(raw: &str) -> Result<TypedValue> {
    use base64::Engine;
    if let Ok(bytes) = hex_decode(raw) {
        return Ok(TypedValue::Blob(bytes));
    }
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map(TypedValue::Blob)
        .map_err(|e| TdtpError::validation(format!("invalid blob encoding: {e}")))
}

fn hex_decode(raw: &str) -> std::result::Result<Vec<u8>, ()> {
    if raw.len() % 2 != 0 || raw.is_empty() || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(());
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Formats a [`TypedValue`] back to its wire representation.
pub fn format_value(value: &TypedValue) -> String {
    match value {
        TypedValue::Null => String::new(),
        TypedValue::Integer(i) => i.to_string(),
        TypedValue::Real(r) => r.to_string(),
        TypedValue::Decimal { raw, .. } => raw.clone(),
        TypedValue::Text(s) => s.clone(),
        TypedValue::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        TypedValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        TypedValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        TypedValue::Timestamp(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        TypedValue::Blob(bytes) => hex_encode(bytes),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
