//! Universal type converter (C7): the one place every adapter turns a
//! driver-native column value into a TDTP wire string, and a TDTP typed
//! value back into something bindable to a driver query parameter.

use chrono::{SecondsFormat, Utc};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::value::{FieldType, TypedValue};

/// A dialect-neutral capture of whatever a driver handed back for one
/// column. Per-dialect adapters populate this from their own row type
/// (`sqlx::sqlite::SqliteRow`, `tiberius::Row`, ...) before handing it here;
/// this function is the only place that decides how it becomes wire text.
#[derive(Debug, Clone)]
pub enum DbValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Date(chrono::NaiveDate),
    DateTime(chrono::NaiveDateTime),
    Timestamp(chrono::DateTime<Utc>),
    /// PostgreSQL `NUMERIC`, already stringified by the adapter (handles
    /// NaN/+-Infinity, which `f64` cannot always round-trip through text).
    Numeric(String),
    /// MSSQL `rowversion`: raw bytes, formatted as leading-zero-trimmed hex.
    RowVersion(Vec<u8>),
}

/// Converts one driver-native value to the TDTP wire string for `field_type`.
/// Times are always emitted as UTC RFC-3339 for `timestamp`/`datetime`.
pub fn db_value_to_wire(value: DbValue, field_type: FieldType) -> Result<String> {
    if matches!(value, DbValue::Null) {
        return Ok(String::new());
    }
    Ok(match (value, field_type) {
        (DbValue::Bool(b), FieldType::Boolean) => if b { "1" } else { "0" }.to_string(),
        (DbValue::I64(i), FieldType::Boolean) => if i != 0 { "1" } else { "0" }.to_string(),
        (DbValue::I64(i), FieldType::Integer) => i.to_string(),
        (DbValue::F64(f), FieldType::Real) => f.to_string(),
        (DbValue::Numeric(s), FieldType::Decimal) => s,
        (DbValue::F64(f), FieldType::Decimal) => f.to_string(),
        (DbValue::Str(s), FieldType::Text) => s,
        (DbValue::Str(s), FieldType::Decimal) => s,
        // Dialects that store dates/times as native TEXT (SQLite) already
        // hand back wire-format strings; pass them through unchanged.
        (DbValue::Str(s), FieldType::Date) => s,
        (DbValue::Str(s), FieldType::DateTime) => s,
        (DbValue::Str(s), FieldType::Timestamp) => s,
        (DbValue::Str(s), FieldType::Blob) => s,
        (DbValue::Uuid(u), FieldType::Text) => u.to_string(),
        (DbValue::Bytes(b), FieldType::Blob) => hex(&b),
        (DbValue::RowVersion(b), FieldType::Blob) => hex_trim_leading_zeros(&b),
        (DbValue::Date(d), FieldType::Date) => d.format("%Y-%m-%d").to_string(),
        (DbValue::DateTime(dt), FieldType::DateTime) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        (DbValue::Timestamp(ts), FieldType::Timestamp) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        (DbValue::DateTime(dt), FieldType::Timestamp) => {
            chrono::DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339_opts(SecondsFormat::Secs, true)
        }
        (other, want) => {
            return Err(TdtpError::Serialization(format!(
                "cannot convert database value {other:?} to field type {want:?}"
            )))
        }
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_trim_leading_zeros(bytes: &[u8]) -> String {
    let full = hex(bytes);
    let trimmed = full.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A value ready to bind to a driver query parameter.
#[derive(Debug, Clone)]
pub enum DbParam {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(chrono::NaiveDate),
    DateTime(chrono::NaiveDateTime),
    Timestamp(chrono::DateTime<Utc>),
}

/// Converts a parsed [`TypedValue`] into a driver parameter. `sqlite_bool_as_int`
/// materializes booleans as `1`/`0` for SQLite, which has no native boolean type.
pub fn typed_value_to_param(value: &TypedValue, sqlite_bool_as_int: bool) -> DbParam {
    match value {
        TypedValue::Null => DbParam::Null,
        TypedValue::Integer(i) => DbParam::I64(*i),
        TypedValue::Real(r) => DbParam::F64(*r),
        TypedValue::Decimal { raw, .. } => DbParam::Str(raw.clone()),
        TypedValue::Text(s) => DbParam::Str(s.clone()),
        TypedValue::Boolean(b) => {
            if sqlite_bool_as_int {
                DbParam::I64(if *b { 1 } else { 0 })
            } else {
                DbParam::Bool(*b)
            }
        }
        TypedValue::Date(d) => DbParam::Date(*d),
        TypedValue::DateTime(dt) => DbParam::DateTime(*dt),
        TypedValue::Timestamp(ts) => DbParam::Timestamp(*ts),
        TypedValue::Blob(b) => DbParam::Bytes(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_from_integer_column_normalizes_to_one_or_zero() {
        assert_eq!(db_value_to_wire(DbValue::I64(5), FieldType::Boolean).unwrap(), "1");
        assert_eq!(db_value_to_wire(DbValue::I64(0), FieldType::Boolean).unwrap(), "0");
    }

    #[test]
    fn null_becomes_empty_wire_string() {
        assert_eq!(db_value_to_wire(DbValue::Null, FieldType::Integer).unwrap(), "");
    }

    #[test]
    fn rowversion_hex_trims_leading_zeros() {
        let out = db_value_to_wire(DbValue::RowVersion(vec![0x00, 0x00, 0x01, 0x2a]), FieldType::Blob).unwrap();
        assert_eq!(out, "12a");
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let ts = chrono::DateTime::parse_from_rfc3339("2024-11-17T10:00:00-05:00")
            .unwrap()
            .with_timezone(&Utc);
        let out = db_value_to_wire(DbValue::Timestamp(ts), FieldType::Timestamp).unwrap();
        assert_eq!(out, "2024-11-17T15:00:00Z");
    }
}
