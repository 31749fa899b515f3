//! Import coordinator (C9): validates a set of packets belong to the same
//! multi-part batch before handing their rows down to
//! [`tdtp_db::import::shadow_table_swap_import`].
//!
//! All of the checks here are whole-batch invariants: one violation fails
//! the entire import rather than skipping the offending part, since a
//! partial import of a batch that failed integrity checking would leave the
//! target table in a state no single packet actually describes.

use std::collections::HashSet;

use tdtp_db::adapter::{Adapter, InsertStrategy};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::Packet;
use tdtp_proto::schema::{schema_equals, Schema};
use tdtp_proto::value::TypedValue;

/// Checks the multi-part integrity invariants across `packets`: shared batch
/// identity, shared schema, shared `TotalParts`/`InReplyTo`, and a
/// `PartNumber` sequence that is in range, unique, and complete.
pub fn validate_multi_part_batch(packets: &[Packet]) -> Result<()> {
    let Some(first) = packets.first() else {
        return Err(TdtpError::MultiPartIntegrity("empty batch".to_string()));
    };
    let batch_identity = first.batch_identity().to_string();
    let total_parts = first.header.total_parts;
    let in_reply_to = &first.header.in_reply_to;

    for packet in packets {
        if packet.batch_identity() != batch_identity {
            return Err(TdtpError::MultiPartIntegrity(format!(
                "batch identity mismatch: expected '{batch_identity}', found '{}'",
                packet.batch_identity()
            )));
        }
        if !schema_equals(&packet.schema, &first.schema) {
            return Err(TdtpError::MultiPartIntegrity("schema differs between parts of the same batch".to_string()));
        }
        if packet.header.total_parts != total_parts {
            return Err(TdtpError::MultiPartIntegrity("TotalParts differs between parts of the same batch".to_string()));
        }
        if &packet.header.in_reply_to != in_reply_to {
            return Err(TdtpError::MultiPartIntegrity("InReplyTo differs between parts of the same batch".to_string()));
        }
    }

    let total = total_parts.ok_or_else(|| TdtpError::MultiPartIntegrity("parts carry no TotalParts".to_string()))?;
    if total as usize != packets.len() {
        return Err(TdtpError::MultiPartIntegrity(format!(
            "expected {total} parts, received {}",
            packets.len()
        )));
    }

    let mut seen = HashSet::new();
    for packet in packets {
        let part = packet
            .header
            .part_number
            .ok_or_else(|| TdtpError::MultiPartIntegrity("part carries no PartNumber".to_string()))?;
        if part < 1 || part > total {
            return Err(TdtpError::MultiPartIntegrity(format!("PartNumber {part} out of range 1..={total}")));
        }
        if !seen.insert(part) {
            return Err(TdtpError::MultiPartIntegrity(format!("duplicate PartNumber {part}")));
        }
    }
    for expected in 1..=total {
        if !seen.contains(&expected) {
            return Err(TdtpError::MultiPartIntegrity(format!("PartNumber {expected} is missing")));
        }
    }

    Ok(())
}

/// Validates `packets` as one multi-part batch, decodes and type-checks
/// every row against the shared schema, then imports them through a
/// shadow-table swap.
pub async fn import_batch(
    adapter: &dyn Adapter,
    table: &str,
    packets: &[Packet],
    strategy: InsertStrategy,
) -> Result<u64> {
    validate_multi_part_batch(packets)?;
    let schema: &Schema = &packets[0].schema;

    let mut ordered: Vec<&Packet> = packets.iter().collect();
    ordered.sort_by_key(|p| p.header.part_number.unwrap_or(0));

    let mut typed_rows: Vec<Vec<TypedValue>> = Vec::new();
    for packet in ordered {
        for raw in packet.decoded_rows()? {
            let fields = tdtp_proto::packet::split_row_fields(&raw);
            typed_rows.push(schema.parse_row(&fields)?);
        }
    }

    tdtp_db::import::shadow_table_swap_import(adapter, table, schema, &typed_rows, strategy).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tdtp_proto::packet::{Data, Header, HeaderType};
    use tdtp_proto::schema::Field;
    use tdtp_proto::value::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![Field {
            key: true,
            ..Field::new("id", FieldType::Integer)
        }])
    }

    fn packet(part: u32, total: u32, rows: Vec<String>) -> Packet {
        Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: HeaderType::Response,
                table_name: "customers".to_string(),
                message_id: format!("BATCH-1-P{part}"),
                in_reply_to: Some("req-1".to_string()),
                part_number: Some(part),
                total_parts: Some(total),
                records_in_part: Some(rows.len() as u32),
                timestamp: Utc::now(),
                sender: None,
                recipient: None,
            },
            query: None,
            query_context: None,
            schema: schema(),
            data: Data { compression: None, checksum: None, rows },
            alarm_details: None,
        }
    }

    #[test]
    fn complete_sequence_validates() {
        let packets = vec![packet(1, 2, vec!["1".into()]), packet(2, 2, vec!["2".into()])];
        assert!(validate_multi_part_batch(&packets).is_ok());
    }

    #[test]
    fn missing_part_is_rejected() {
        let packets = vec![packet(1, 3, vec!["1".into()]), packet(3, 3, vec!["2".into()])];
        let err = validate_multi_part_batch(&packets).unwrap_err();
        assert!(matches!(err, TdtpError::MultiPartIntegrity(_)));
    }

    #[test]
    fn schema_drift_between_parts_is_rejected() {
        let mut packets = vec![packet(1, 2, vec!["1".into()]), packet(2, 2, vec!["2".into()])];
        packets[1].schema = Schema::new(vec![Field::new("id", FieldType::Text)]);
        let err = validate_multi_part_batch(&packets).unwrap_err();
        assert!(matches!(err, TdtpError::MultiPartIntegrity(_)));
    }

    #[test]
    fn mismatched_batch_identity_is_rejected() {
        let mut packets = vec![packet(1, 2, vec!["1".into()]), packet(2, 2, vec!["2".into()])];
        packets[1].header.message_id = "OTHER-BATCH-P2".to_string();
        let err = validate_multi_part_batch(&packets).unwrap_err();
        assert!(matches!(err, TdtpError::MultiPartIntegrity(_)));
    }

    async fn sqlite_adapter() -> tdtp_db::SqliteAdapter {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        tdtp_db::SqliteAdapter::new(pool)
    }

    #[tokio::test]
    async fn batch_imports_into_sqlite_through_a_shadow_swap() {
        let adapter = sqlite_adapter().await;
        let packets = vec![packet(1, 2, vec!["1".into()]), packet(2, 2, vec!["2".into()])];

        let inserted = import_batch(&adapter, "customers", &packets, InsertStrategy::Copy).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(adapter.row_count("customers").await.unwrap(), 2);
        assert!(!adapter.table_exists("customers_old").await.unwrap());
    }

    #[tokio::test]
    async fn failed_import_leaves_the_existing_table_untouched() {
        let adapter = sqlite_adapter().await;
        adapter.create_table("customers", &schema()).await.unwrap();
        adapter
            .insert_rows("customers", &schema(), &[vec![TypedValue::Integer(9)]], InsertStrategy::Copy)
            .await
            .unwrap();

        // Duplicate key inside the batch: the staging insert conflicts
        // under the fail strategy and the swap never happens.
        let packets = vec![packet(1, 2, vec!["1".into(), "1".into()]), packet(2, 2, vec!["2".into()])];
        let err = import_batch(&adapter, "customers", &packets, InsertStrategy::Fail).await.unwrap_err();
        assert!(matches!(err, TdtpError::StrategyConflict { .. }));

        let rows = adapter.read_all("customers", &schema(), true).await.unwrap();
        assert_eq!(rows, vec![vec![TypedValue::Integer(9)]]);
    }

    #[tokio::test]
    async fn compressed_parts_import_like_plain_ones() {
        let adapter = sqlite_adapter().await;
        let big_rows: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        let mut p = packet(1, 1, big_rows);
        p.compress_data(3, 64).unwrap();
        assert_eq!(p.data.compression.as_deref(), Some("zstd"));

        let inserted = import_batch(&adapter, "numbers", &[p], InsertStrategy::Copy).await.unwrap();
        assert_eq!(inserted, 200);
    }
}
