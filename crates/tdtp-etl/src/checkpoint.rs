//! Incremental sync (C12): TDTQL query construction from a persisted
//! checkpoint, and the checkpoint store itself.
//!
//! State is kept in a self-contained single-file SQLite database, the same
//! "one file holds everything" convention the wire format uses for a whole
//! batch. A failed export must never advance the checkpoint — on failure the
//! caller records the error through [`CheckpointStore::record_failure`] and
//! the stored value stays where it was.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::packet::Packet;
use tdtp_proto::query::ast::{CompareOp, Filter, FilterNode, OrderKey};
use tdtp_proto::query::{compare_values, Query};
use tdtp_proto::value::TypedValue;

/// One table's persisted sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub last_sync_value: Option<String>,
    pub last_sync_time: String,
    pub last_error: Option<String>,
}

pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Opens (creating if needed) the checkpoint database at `url`, e.g.
    /// `sqlite://./state/checkpoints.db`. The pool holds a single
    /// connection, which doubles as the run's advisory exclusive lock on
    /// the state file.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| TdtpError::Config(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                pipeline_name TEXT NOT NULL,
                source_id TEXT NOT NULL,
                tracking_field TEXT NOT NULL,
                last_sync_value TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (pipeline_name, source_id)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(CheckpointStore { pool })
    }

    /// The last synced tracking value for `(pipeline_name, source_id)`, or
    /// `None` if this is the first run (a full, unfiltered load).
    pub async fn last_sync_value(&self, pipeline_name: &str, source_id: &str) -> Result<Option<String>> {
        Ok(self.state(pipeline_name, source_id).await?.and_then(|s| s.last_sync_value))
    }

    /// The full persisted state for `(pipeline_name, source_id)`, if any.
    pub async fn state(&self, pipeline_name: &str, source_id: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT last_sync_value, last_error, updated_at FROM checkpoints WHERE pipeline_name = ? AND source_id = ?",
        )
        .bind(pipeline_name)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(row.map(|r| SyncState {
            last_sync_value: r.try_get::<Option<String>, _>("last_sync_value").unwrap_or(None),
            last_sync_time: r.try_get::<String, _>("updated_at").unwrap_or_default(),
            last_error: r.try_get::<Option<String>, _>("last_error").unwrap_or(None),
        }))
    }

    /// Advances the checkpoint to `new_value` and clears any recorded
    /// error. Only call this once the export it's based on has been
    /// committed; never call it on failure.
    pub async fn advance(&self, pipeline_name: &str, source_id: &str, tracking_field: &str, new_value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (pipeline_name, source_id, tracking_field, last_sync_value, last_error, updated_at)
             VALUES (?, ?, ?, ?, NULL, datetime('now'))
             ON CONFLICT(pipeline_name, source_id) DO UPDATE SET
                tracking_field = excluded.tracking_field,
                last_sync_value = excluded.last_sync_value,
                last_error = NULL,
                updated_at = excluded.updated_at",
        )
        .bind(pipeline_name)
        .bind(source_id)
        .bind(tracking_field)
        .bind(new_value)
        .execute(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    /// Records a failed sync attempt. The checkpoint value is untouched, so
    /// the next run retries the same window.
    pub async fn record_failure(&self, pipeline_name: &str, source_id: &str, tracking_field: &str, error: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (pipeline_name, source_id, tracking_field, last_sync_value, last_error, updated_at)
             VALUES (?, ?, ?, NULL, ?, datetime('now'))
             ON CONFLICT(pipeline_name, source_id) DO UPDATE SET
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(pipeline_name)
        .bind(source_id)
        .bind(tracking_field)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }
}

/// Builds the TDTQL query for one incremental sync pass: rows whose
/// tracking field is strictly greater than the last synced value, ordered
/// ascending by that same field so the new maximum is easy to recover from
/// the tail of the result, paged by `batch_size` when set.
pub fn incremental_query(tracking_field: &str, last_sync_value: Option<&str>, batch_size: Option<i64>) -> Query {
    let mut query = Query::new().with_order_by(vec![OrderKey::asc(tracking_field)]);
    if let Some(last) = last_sync_value {
        query = query.with_filters(FilterNode::Leaf(Filter::new(
            tracking_field,
            CompareOp::Gt,
            Some(last.to_string()),
        )));
    }
    if let Some(limit) = batch_size {
        query = query.with_limit(limit);
    }
    query
}

/// Extracts the new checkpoint value: the tracking field's value on the
/// last exported row, assuming rows arrived in the ascending order
/// [`incremental_query`] requested.
pub fn next_checkpoint_value(tracking_field: &str, schema: &tdtp_proto::schema::Schema, rows: &[Vec<String>]) -> Result<Option<String>> {
    let Some(idx) = schema.field_index(tracking_field) else {
        return Err(TdtpError::validation(format!("unknown tracking field '{tracking_field}'")));
    };
    Ok(rows.last().map(|r| r[idx].clone()))
}

/// Extracts the new checkpoint as the maximum tracking-field value across
/// every row of every emitted packet. Unlike [`next_checkpoint_value`] this
/// does not assume any ordering; it compares values through the schema's
/// declared type rather than lexically.
pub fn next_checkpoint_from_packets(tracking_field: &str, packets: &[Packet]) -> Result<Option<String>> {
    let Some(first) = packets.first() else {
        return Ok(None);
    };
    let idx = first
        .schema
        .field_index(tracking_field)
        .ok_or_else(|| TdtpError::validation(format!("unknown tracking field '{tracking_field}'")))?;

    let mut max: Option<TypedValue> = None;
    for packet in packets {
        for raw in packet.decoded_rows()? {
            let fields = tdtp_proto::packet::split_row_fields(&raw);
            let mut typed = packet.schema.parse_row(&fields)?;
            let candidate = typed.swap_remove(idx);
            if candidate.is_null() {
                continue;
            }
            max = match max {
                None => Some(candidate),
                Some(current) => {
                    if compare_values(&candidate, &current)? == std::cmp::Ordering::Greater {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
    }
    Ok(max.map(|v| tdtp_proto::value::format_value(&v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_proto::query::execute;
    use tdtp_proto::schema::{Field, Schema};
    use tdtp_proto::value::{parse_value, FieldType, ValueConstraints};

    #[tokio::test]
    async fn first_run_has_no_checkpoint_and_unfiltered_query_has_no_filters() {
        let store = CheckpointStore::open("sqlite::memory:").await.unwrap();
        let last = store.last_sync_value("orders_sync", "orders").await.unwrap();
        assert_eq!(last, None);

        let query = incremental_query("updated_at", last.as_deref(), Some(500));
        assert!(query.filters.is_none());
        assert_eq!(query.limit, Some(500));
    }

    #[tokio::test]
    async fn advancing_then_reading_round_trips() {
        let store = CheckpointStore::open("sqlite::memory:").await.unwrap();
        store.advance("orders_sync", "orders", "updated_at", "2026-01-01T00:00:00Z").await.unwrap();
        let last = store.last_sync_value("orders_sync", "orders").await.unwrap();
        assert_eq!(last.as_deref(), Some("2026-01-01T00:00:00Z"));

        let query = incremental_query("updated_at", last.as_deref(), None);
        assert!(query.filters.is_some());
    }

    #[tokio::test]
    async fn failure_records_the_error_without_touching_the_checkpoint() {
        let store = CheckpointStore::open("sqlite::memory:").await.unwrap();
        store.advance("orders_sync", "orders", "updated_at", "2026-01-01T00:00:00Z").await.unwrap();
        store.record_failure("orders_sync", "orders", "updated_at", "connection refused").await.unwrap();

        let state = store.state("orders_sync", "orders").await.unwrap().unwrap();
        assert_eq!(state.last_sync_value.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(state.last_error.as_deref(), Some("connection refused"));

        // The next successful advance clears the error again.
        store.advance("orders_sync", "orders", "updated_at", "2026-02-01T00:00:00Z").await.unwrap();
        let state = store.state("orders_sync", "orders").await.unwrap().unwrap();
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn next_checkpoint_value_reads_the_last_row() {
        let schema = Schema::new(vec![Field::new("updated_at", FieldType::Text)]);
        let rows = vec![vec!["a".to_string()], vec!["z".to_string()]];
        let next = next_checkpoint_value("updated_at", &schema, &rows).unwrap();
        assert_eq!(next.as_deref(), Some("z"));
    }

    fn datetime_rows(values: &[&str]) -> (Schema, Vec<Vec<tdtp_proto::value::TypedValue>>) {
        let schema = Schema::new(vec![Field::new("updated_at", FieldType::DateTime)]);
        let constraints = ValueConstraints {
            field_type: FieldType::DateTime,
            length: None,
            precision: None,
            scale: None,
        };
        let rows = values
            .iter()
            .map(|v| vec![parse_value(v, &constraints).unwrap()])
            .collect();
        (schema, rows)
    }

    #[test]
    fn checkpoint_from_packets_is_the_typed_maximum_across_parts() {
        use chrono::Utc;
        use tdtp_proto::packet::{Data, Header, HeaderType};

        let schema = Schema::new(vec![Field::new("updated_at", FieldType::DateTime)]);
        let make_packet = |part: u32, rows: Vec<String>| Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: HeaderType::Reference,
                table_name: "orders".to_string(),
                message_id: format!("SYNC-1-P{part}"),
                in_reply_to: None,
                part_number: Some(part),
                total_parts: Some(2),
                records_in_part: Some(rows.len() as u32),
                timestamp: Utc::now(),
                sender: None,
                recipient: None,
            },
            query: None,
            query_context: None,
            schema: schema.clone(),
            data: Data {
                compression: None,
                checksum: None,
                rows,
            },
            alarm_details: None,
        };

        // The maximum sits in the middle of part 1, so reading the last row
        // of the last part would give the wrong answer here.
        let packets = vec![
            make_packet(1, vec!["2024-11-17 10:00:00".into(), "2024-11-17 12:00:00".into()]),
            make_packet(2, vec!["2024-11-17 11:00:00".into()]),
        ];
        let next = next_checkpoint_from_packets("updated_at", &packets).unwrap();
        assert_eq!(next.as_deref(), Some("2024-11-17 12:00:00"));
    }

    #[test]
    fn incremental_sync_exports_everything_then_nothing() {
        let (schema, rows) = datetime_rows(&[
            "2024-11-17 10:00:00",
            "2024-11-17 12:00:00",
            "2024-11-17 11:00:00",
        ]);

        // First run: empty checkpoint, the query carries no filter and
        // everything is exported in ascending order.
        let query = incremental_query("updated_at", None, None);
        let (exported, _) = execute(&query, &schema, &rows).unwrap();
        assert_eq!(exported.len(), 3);

        let exported_raw: Vec<Vec<String>> = exported
            .iter()
            .map(|r| r.iter().map(tdtp_proto::value::format_value).collect())
            .collect();
        let checkpoint = next_checkpoint_value("updated_at", &schema, &exported_raw).unwrap().unwrap();
        assert_eq!(checkpoint, "2024-11-17 12:00:00");

        // Second run against the same data: nothing is newer than the
        // checkpoint, so zero rows come back and the checkpoint stands.
        let query = incremental_query("updated_at", Some(&checkpoint), None);
        let (exported, _) = execute(&query, &schema, &rows).unwrap();
        assert!(exported.is_empty());
    }
}
