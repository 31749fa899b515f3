//! Merge engine (C10): combines N row sets sharing one schema.
//!
//! Rows are matched by the schema's key fields when it declares any;
//! otherwise the whole row is the match key. A schema mismatch between any
//! two inputs is rejected outright — merging is only defined over multiple
//! views of the same table shape.
//!
//! Inputs are ordered and that order is precedence: `union`/`intersection`
//! take the earliest input's row on a key conflict, `left` keeps only the
//! first input's keys, `right` keeps only the last input's keys (both still
//! consulting every other input to detect conflicts), and `append`
//! concatenates every input verbatim with no dedup or conflict detection.

use std::collections::BTreeMap;

use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::Packet;
use tdtp_proto::schema::{schema_equals, Schema};
use tdtp_proto::value::{format_value, TypedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Every distinct key from any input; earliest input wins on conflict.
    Union,
    /// Only keys present in every input; earliest input wins on conflict.
    Intersection,
    /// Only keys present in the first input; the rest are consulted only to detect conflicts.
    Left,
    /// Only keys present in the last input; the rest are consulted only to detect conflicts.
    Right,
    /// Every row from every input, concatenated, duplicates and all.
    Append,
}

/// A key present in more than one input with differing non-key field values.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub key: String,
    /// The row that won the merge for this key.
    pub winning_row: Vec<String>,
    /// A row from another input that disagreed with the winner.
    pub other_row: Vec<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub schema: Schema,
    pub rows: Vec<Vec<TypedValue>>,
    pub conflicts: Vec<MergeConflict>,
}

/// Resolves the match-key column indices: an explicit key-field list wins,
/// then the schema's declared keys, then the whole row.
fn key_indices(schema: &Schema, key_fields: Option<&[&str]>) -> Result<Vec<usize>> {
    match key_fields {
        Some(fields) => fields
            .iter()
            .map(|name| {
                schema
                    .field_index(name)
                    .ok_or_else(|| TdtpError::validation(format!("unknown merge key field '{name}'")))
            })
            .collect(),
        None => Ok(schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.key)
            .map(|(i, _)| i)
            .collect()),
    }
}

fn row_key(indices: &[usize], row: &[TypedValue]) -> String {
    if indices.is_empty() {
        row.iter().map(format_value).collect::<Vec<_>>().join("|")
    } else {
        indices.iter().map(|&i| format_value(&row[i])).collect::<Vec<_>>().join("|")
    }
}

fn wire_row(row: &[TypedValue]) -> Vec<String> {
    row.iter().map(format_value).collect()
}

/// Merges exactly two row sets. A thin convenience wrapper over [`merge_all`]
/// for the common two-input case.
pub fn merge(
    strategy: MergeStrategy,
    left_schema: &Schema,
    left_rows: &[Vec<TypedValue>],
    right_schema: &Schema,
    right_rows: &[Vec<TypedValue>],
) -> Result<MergeOutcome> {
    merge_all(strategy, &[(left_schema, left_rows), (right_schema, right_rows)])
}

/// Merges `inputs` (each a schema paired with its rows) into one outcome,
/// per [`MergeStrategy`], matching rows by the schemas' declared key
/// fields. `inputs` must contain at least one element and every schema
/// must match the first.
pub fn merge_all(strategy: MergeStrategy, inputs: &[(&Schema, &[Vec<TypedValue>])]) -> Result<MergeOutcome> {
    merge_all_by(strategy, inputs, None)
}

/// [`merge_all`] with an explicit key-field list overriding the schema's
/// declared keys.
pub fn merge_all_by(
    strategy: MergeStrategy,
    inputs: &[(&Schema, &[Vec<TypedValue>])],
    key_fields: Option<&[&str]>,
) -> Result<MergeOutcome> {
    let Some((first_schema, _)) = inputs.first() else {
        return Err(TdtpError::validation("merge requires at least one input"));
    };
    for (schema, _) in inputs {
        if !schema_equals(schema, first_schema) {
            return Err(TdtpError::validation("merge inputs have mismatched schemas"));
        }
    }

    if strategy == MergeStrategy::Append {
        let rows: Vec<Vec<TypedValue>> = inputs.iter().flat_map(|(_, rows)| rows.iter().cloned()).collect();
        return Ok(MergeOutcome {
            schema: (*first_schema).clone(),
            rows,
            conflicts: Vec::new(),
        });
    }

    let indices = key_indices(first_schema, key_fields)?;
    let by_key: Vec<BTreeMap<String, &Vec<TypedValue>>> = inputs
        .iter()
        .map(|(_, rows)| rows.iter().map(|r| (row_key(&indices, r), r)).collect())
        .collect();

    // The earliest input holding each key is that key's default winner;
    // `left`/`right` override this below by restricting which keys survive.
    let mut winners: BTreeMap<String, &Vec<TypedValue>> = BTreeMap::new();
    for map in &by_key {
        for (key, row) in map {
            winners.entry(key.clone()).or_insert(*row);
        }
    }

    let mut conflicts = Vec::new();
    for (key, winner) in &winners {
        for map in &by_key {
            if let Some(other) = map.get(key) {
                if *other != *winner {
                    conflicts.push(MergeConflict {
                        key: key.clone(),
                        winning_row: wire_row(winner),
                        other_row: wire_row(other),
                    });
                }
            }
        }
    }

    let selected_keys: Vec<&String> = match strategy {
        MergeStrategy::Union => winners.keys().collect(),
        MergeStrategy::Intersection => winners.keys().filter(|k| by_key.iter().all(|map| map.contains_key(*k))).collect(),
        MergeStrategy::Left => by_key.first().map(|map| map.keys().collect()).unwrap_or_default(),
        MergeStrategy::Right => by_key.last().map(|map| map.keys().collect()).unwrap_or_default(),
        MergeStrategy::Append => unreachable!(),
    };

    let rows: Vec<Vec<TypedValue>> = match strategy {
        MergeStrategy::Right => {
            let last_map = by_key.last();
            selected_keys
                .into_iter()
                .filter_map(|k| last_map.and_then(|map| map.get(k)).map(|r| (*r).clone()))
                .collect()
        }
        _ => selected_keys.into_iter().filter_map(|k| winners.get(k).map(|r| (*r).clone())).collect(),
    };

    Ok(MergeOutcome {
        schema: (*first_schema).clone(),
        rows,
        conflicts,
    })
}

/// Merges N packets' decoded row sets. Each packet's Data is decoded
/// (verifying checksum and decompressing where set) and type-checked
/// against its own schema before the merge runs.
pub fn merge_packets(strategy: MergeStrategy, packets: &[Packet], key_fields: Option<&[&str]>) -> Result<MergeOutcome> {
    let mut decoded: Vec<Vec<Vec<TypedValue>>> = Vec::with_capacity(packets.len());
    for packet in packets {
        let mut rows = Vec::new();
        for raw in packet.decoded_rows()? {
            let fields = tdtp_proto::packet::split_row_fields(&raw);
            rows.push(packet.schema.parse_row(&fields)?);
        }
        decoded.push(rows);
    }
    let inputs: Vec<(&Schema, &[Vec<TypedValue>])> = packets
        .iter()
        .zip(&decoded)
        .map(|(p, rows)| (&p.schema, rows.as_slice()))
        .collect();
    merge_all_by(strategy, &inputs, key_fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_proto::schema::Field;
    use tdtp_proto::value::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field { key: true, ..Field::new("id", FieldType::Integer) },
            Field::new("name", FieldType::Text),
        ])
    }

    fn row(id: i64, name: &str) -> Vec<TypedValue> {
        vec![TypedValue::Integer(id), TypedValue::Text(name.to_string())]
    }

    #[test]
    fn union_is_idempotent() {
        let schema = schema();
        let rows = vec![row(1, "a"), row(2, "b")];
        let outcome = merge(MergeStrategy::Union, &schema, &rows, &schema, &rows).unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn intersection_is_idempotent() {
        let schema = schema();
        let rows = vec![row(1, "a"), row(2, "b")];
        let outcome = merge(MergeStrategy::Intersection, &schema, &rows, &schema, &rows).unwrap();
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn append_doubles_row_count() {
        let schema = schema();
        let rows = vec![row(1, "a")];
        let outcome = merge(MergeStrategy::Append, &schema, &rows, &schema, &rows).unwrap();
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn conflicting_key_is_surfaced_and_left_wins() {
        let schema = schema();
        let left = vec![row(1, "a")];
        let right = vec![row(1, "different")];
        let outcome = merge(MergeStrategy::Union, &schema, &left, &schema, &right).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "a")]);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].key, "1");
    }

    #[test]
    fn left_only_keeps_left_side_keys() {
        let schema = schema();
        let left = vec![row(1, "a")];
        let right = vec![row(1, "a"), row(2, "b")];
        let outcome = merge(MergeStrategy::Left, &schema, &left, &schema, &right).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "a")]);
    }

    #[test]
    fn mismatched_schema_is_rejected() {
        let schema_a = schema();
        let schema_b = Schema::new(vec![Field::new("id", FieldType::Integer)]);
        let err = merge(MergeStrategy::Union, &schema_a, &[], &schema_b, &[]).unwrap_err();
        assert!(matches!(err, TdtpError::Validation(_)));
    }

    #[test]
    fn union_over_three_inputs_takes_every_distinct_key() {
        let schema = schema();
        let a = vec![row(1, "a")];
        let b = vec![row(2, "b")];
        let c = vec![row(3, "c")];
        let outcome = merge_all(MergeStrategy::Union, &[(&schema, &a), (&schema, &b), (&schema, &c)]).unwrap();
        let mut ids: Vec<i64> = outcome.rows.iter().map(|r| match r[0] {
            TypedValue::Integer(i) => i,
            _ => unreachable!(),
        }).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn union_over_three_inputs_earliest_wins_and_surfaces_every_disagreement() {
        let schema = schema();
        let a = vec![row(1, "a")];
        let b = vec![row(1, "b")];
        let c = vec![row(1, "c")];
        let outcome = merge_all(MergeStrategy::Union, &[(&schema, &a), (&schema, &b), (&schema, &c)]).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "a")]);
        assert_eq!(outcome.conflicts.len(), 2);
    }

    #[test]
    fn intersection_over_three_inputs_requires_presence_in_all() {
        let schema = schema();
        let a = vec![row(1, "a"), row(2, "a")];
        let b = vec![row(1, "a"), row(2, "a")];
        let c = vec![row(1, "a")];
        let outcome = merge_all(MergeStrategy::Intersection, &[(&schema, &a), (&schema, &b), (&schema, &c)]).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "a")]);
    }

    #[test]
    fn right_over_three_inputs_keeps_only_the_last_inputs_keys_and_values() {
        let schema = schema();
        let a = vec![row(1, "a")];
        let b = vec![row(2, "b")];
        let c = vec![row(1, "from-c")];
        let outcome = merge_all(MergeStrategy::Right, &[(&schema, &a), (&schema, &b), (&schema, &c)]).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "from-c")]);
    }

    #[test]
    fn append_over_three_inputs_concatenates_all() {
        let schema = schema();
        let a = vec![row(1, "a")];
        let b = vec![row(1, "a")];
        let c = vec![row(1, "a")];
        let outcome = merge_all(MergeStrategy::Append, &[(&schema, &a), (&schema, &b), (&schema, &c)]).unwrap();
        assert_eq!(outcome.rows.len(), 3);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn explicit_key_fields_override_schema_keys() {
        // Schema declares `id` as the key, but merging on `name` instead
        // makes rows 1/"a" and 2/"a" the same logical record.
        let schema = schema();
        let left = vec![row(1, "a")];
        let right = vec![row(2, "a")];
        let outcome = merge_all_by(MergeStrategy::Union, &[(&schema, &left), (&schema, &right)], Some(&["name"])).unwrap();
        assert_eq!(outcome.rows, vec![row(1, "a")]);
        assert_eq!(outcome.conflicts.len(), 1);
    }

    #[test]
    fn unknown_explicit_key_field_is_rejected() {
        let schema = schema();
        let rows = vec![row(1, "a")];
        let err = merge_all_by(MergeStrategy::Union, &[(&schema, &rows)], Some(&["nope"])).unwrap_err();
        assert!(matches!(err, TdtpError::Validation(_)));
    }

    #[test]
    fn packets_merge_through_their_decoded_rows() {
        use chrono::Utc;
        use tdtp_proto::packet::{escape_row_fields, Data, Header, HeaderType};

        let make_packet = |id: u32, rows: Vec<Vec<String>>| Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: HeaderType::Reference,
                table_name: "customers".to_string(),
                message_id: format!("MERGE-{id}-P1"),
                in_reply_to: None,
                part_number: Some(1),
                total_parts: Some(1),
                records_in_part: Some(rows.len() as u32),
                timestamp: Utc::now(),
                sender: None,
                recipient: None,
            },
            query: None,
            query_context: None,
            schema: schema(),
            data: Data {
                compression: None,
                checksum: None,
                rows: rows.iter().map(|r| escape_row_fields(r)).collect(),
            },
            alarm_details: None,
        };

        let a = make_packet(1, vec![vec!["1".into(), "alice".into()]]);
        let b = make_packet(2, vec![vec!["2".into(), "bob".into()]]);
        let outcome = merge_packets(MergeStrategy::Union, &[a, b], None).unwrap();
        assert_eq!(outcome.rows.len(), 2);
    }
}
