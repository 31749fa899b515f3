//! Schema model (C2): an ordered list of fields describing one table slice.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TdtpError};
use crate::value::{parse_value, FieldType, TypedValue, ValueConstraints};

/// One column of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// `0` or `-1` means unbounded.
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub key: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Dialect-specific subtype hint (e.g. Postgres `uuid`, `jsonb`).
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            field_type,
            length: None,
            precision: None,
            scale: None,
            key: false,
            timezone: None,
            subtype: None,
            read_only: false,
        }
    }

    pub fn is_length_unbounded(&self) -> bool {
        matches!(self.length, None | Some(0) | Some(i64::MIN..=-1))
    }

    fn constraints(&self) -> ValueConstraints {
        ValueConstraints {
            field_type: self.field_type,
            length: if self.is_length_unbounded() {
                None
            } else {
                self.length
            },
            precision: self.precision,
            scale: self.scale,
        }
    }
}

/// An ordered list of [`Field`]s. Equality is order-sensitive on
/// `(name, type)` only — length/precision/key/etc. may differ without
/// breaking the "same schema" contract used for multi-part identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema { fields }
    }

    pub fn key_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.key).collect()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Canonicalizes a field name to the schema's own casing, per the
    /// TDTQL executor's "normalize field names to canonical schema casing"
    /// requirement.
    pub fn canonical_name(&self, name: &str) -> Result<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.name.as_str())
            .ok_or_else(|| TdtpError::validation(format!("unknown field '{name}'")))
    }

    pub fn parse_row(&self, values: &[String]) -> Result<Vec<TypedValue>> {
        if values.len() != self.fields.len() {
            return Err(TdtpError::validation(format!(
                "row has {} values, schema has {} fields",
                values.len(),
                self.fields.len()
            )));
        }
        self.fields
            .iter()
            .zip(values)
            .map(|(field, raw)| parse_value(raw, &field.constraints()))
            .collect()
    }
}

/// Two schemas are equal iff their field lists agree in order on `(name, type)`.
pub fn schema_equals(a: &Schema, b: &Schema) -> bool {
    a.fields.len() == b.fields.len()
        && a.fields
            .iter()
            .zip(&b.fields)
            .all(|(x, y)| x.name == y.name && x.field_type == y.field_type)
}

/// Validates schema-level invariants: non-empty, unique (case-sensitive)
/// field names, known type, decimal precision > 0 with `0 <= scale <= precision`.
pub fn validate_schema(schema: &Schema) -> Result<()> {
    if schema.fields.is_empty() {
        return Err(TdtpError::validation("schema must have at least one field"));
    }
    let mut seen = HashSet::new();
    for field in &schema.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(TdtpError::validation(format!(
                "duplicate field name '{}'",
                field.name
            )));
        }
        if field.field_type == FieldType::Decimal {
            let precision = field.precision.unwrap_or(0);
            if precision == 0 {
                return Err(TdtpError::validation(format!(
                    "decimal field '{}' must declare precision > 0",
                    field.name
                )));
            }
            let scale = field.scale.unwrap_or(0);
            if scale > precision {
                return Err(TdtpError::validation(format!(
                    "decimal field '{}' has scale {} > precision {}",
                    field.name, scale, precision
                )));
            }
        }
    }
    Ok(())
}

/// Validates that every row matches the schema's arity and field types.
pub fn validate_row(values: &[String], schema: &Schema) -> Result<()> {
    schema.parse_row(values).map(|_| ())
}

/// Rejects duplicate combined primary-key values across rows.
pub fn validate_primary_key(rows: &[Vec<String>], schema: &Schema) -> Result<()> {
    let key_indices: Vec<usize> = schema
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.key)
        .map(|(i, _)| i)
        .collect();
    if key_indices.is_empty() {
        return Ok(());
    }
    let mut seen = HashSet::new();
    for row in rows {
        let key: Vec<&str> = key_indices.iter().map(|&i| row[i].as_str()).collect();
        if !seen.insert(key.clone()) {
            return Err(TdtpError::validation(format!(
                "duplicate primary key value: {}",
                key.join("|")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Field {
                key: true,
                ..Field::new("id", FieldType::Integer)
            },
            Field::new("name", FieldType::Text),
        ])
    }

    #[test]
    fn schema_equality_is_order_and_type_sensitive() {
        let a = sample_schema();
        let mut b = sample_schema();
        assert!(schema_equals(&a, &b));
        b.fields.swap(0, 1);
        assert!(!schema_equals(&a, &b));
    }

    #[test]
    fn validate_schema_rejects_duplicate_names() {
        let schema = Schema::new(vec![Field::new("id", FieldType::Integer), Field::new("id", FieldType::Text)]);
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn validate_schema_rejects_bad_decimal_bounds() {
        let schema = Schema::new(vec![Field {
            precision: Some(4),
            scale: Some(5),
            ..Field::new("amount", FieldType::Decimal)
        }]);
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn primary_key_duplicates_are_rejected() {
        let schema = sample_schema();
        let rows = vec![
            vec!["1".into(), "a".into()],
            vec!["1".into(), "b".into()],
        ];
        assert!(validate_primary_key(&rows, &schema).is_err());
    }

    #[test]
    fn primary_key_unique_values_pass() {
        let schema = sample_schema();
        let rows = vec![
            vec!["1".into(), "a".into()],
            vec!["2".into(), "b".into()],
        ];
        assert!(validate_primary_key(&rows, &schema).is_ok());
    }
}
