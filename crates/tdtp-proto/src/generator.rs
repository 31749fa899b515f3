//! Partitioning and streaming packet generation (C6).
//!
//! Both the batched and streaming entry points build parts through the same
//! [`PacketBuilder`] so the partitioning rule — and the tests written
//! against it — hold identically for both modes.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TdtpError};
use crate::packet::{escape_row_fields, Data, Header, HeaderType, Packet};
use crate::query::QueryContext;
use crate::schema::Schema;

/// Default packet byte budget, chosen to keep final XML under ~1.9 MB.
pub const DEFAULT_BUDGET_BYTES: usize = 3_800_000;

/// Fixed per-part overhead (envelope, header fields) reserved from the budget.
const PART_OVERHEAD_BYTES: usize = 5_000;

/// Worst-case UTF-16 row size estimate: `(sum(len(field)+1) + 10) * 2`.
fn estimate_row_size(fields: &[String]) -> usize {
    let raw: usize = fields.iter().map(|f| f.len() + 1).sum::<usize>() + 10;
    raw * 2
}

/// Accumulates rows into size-bounded parts, sharing the emission logic
/// used by both [`generate_batch`] and the streaming producer loop.
pub struct PacketBuilder {
    budget: usize,
    schema: Schema,
    table_name: String,
    header_type: HeaderType,
    base_message_id: String,
    in_reply_to: Option<String>,
    current_rows: Vec<String>,
    current_size: usize,
    parts_emitted: u32,
}

impl PacketBuilder {
    pub fn new(
        schema: Schema,
        table_name: impl Into<String>,
        header_type: HeaderType,
        base_message_id: impl Into<String>,
        in_reply_to: Option<String>,
    ) -> Self {
        PacketBuilder {
            budget: DEFAULT_BUDGET_BYTES,
            schema,
            table_name: table_name.into(),
            header_type,
            base_message_id: base_message_id.into(),
            in_reply_to,
            current_rows: Vec::new(),
            current_size: 0,
            parts_emitted: 0,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Appends one row (already-typed field strings), returning a completed
    /// part if the new row would have exceeded the budget.
    pub fn push_row(&mut self, fields: Vec<String>) -> Option<RawPart> {
        let row_size = estimate_row_size(&fields);
        let flushed = if !self.current_rows.is_empty()
            && self.current_size + row_size + PART_OVERHEAD_BYTES > self.budget
        {
            Some(self.flush())
        } else {
            None
        };
        self.current_size += row_size;
        self.current_rows.push(escape_row_fields(&fields));
        flushed
    }

    fn flush(&mut self) -> RawPart {
        self.parts_emitted += 1;
        self.current_size = 0;
        RawPart {
            part_number: self.parts_emitted,
            rows: std::mem::take(&mut self.current_rows),
        }
    }

    /// Flushes whatever rows remain into a final part, if any.
    pub fn finish(&mut self) -> Option<RawPart> {
        if self.current_rows.is_empty() {
            None
        } else {
            Some(self.flush())
        }
    }

    pub fn parts_emitted(&self) -> u32 {
        self.parts_emitted
    }

    /// Turns a [`RawPart`] into a full [`Packet`], given the (possibly still
    /// unknown) total part count.
    fn build_packet(&self, part: &RawPart, total_parts: u32, query_context: Option<QueryContext>) -> Packet {
        let message_id = format!("{}-P{}", self.base_message_id, part.part_number);
        Packet {
            version: "1.0".to_string(),
            header: Header {
                header_type: self.header_type,
                table_name: self.table_name.clone(),
                message_id,
                in_reply_to: self.in_reply_to.clone(),
                part_number: Some(part.part_number),
                total_parts: Some(total_parts),
                records_in_part: Some(part.rows.len() as u32),
                timestamp: Utc::now(),
                sender: None,
                recipient: None,
            },
            query: if part.part_number == 1 {
                query_context.as_ref().map(|qc| qc.query.clone())
            } else {
                None
            },
            query_context: if part.part_number == 1 { query_context } else { None },
            schema: self.schema.clone(),
            data: Data {
                compression: None,
                checksum: None,
                rows: part.rows.clone(),
            },
            alarm_details: None,
        }
    }
}

/// An accumulated part before its header's `TotalParts` is known.
pub struct RawPart {
    pub part_number: u32,
    pub rows: Vec<String>,
}

/// Batched mode: materializes every part with `TotalParts` already resolved.
pub fn generate_batch(
    schema: Schema,
    rows: Vec<Vec<String>>,
    table_name: impl Into<String>,
    header_type: HeaderType,
    base_message_id: impl Into<String>,
    in_reply_to: Option<String>,
    query_context: Option<QueryContext>,
    budget: usize,
) -> Result<Vec<Packet>> {
    let mut builder = PacketBuilder::new(schema, table_name, header_type, base_message_id, in_reply_to)
        .with_budget(budget);
    let mut raw_parts = Vec::new();
    for row in rows {
        if let Some(part) = builder.push_row(row) {
            raw_parts.push(part);
        }
    }
    if let Some(part) = builder.finish() {
        raw_parts.push(part);
    }
    if raw_parts.is_empty() {
        // Still emit one empty part so the batch is self-describing even
        // with zero rows.
        raw_parts.push(RawPart {
            part_number: 1,
            rows: Vec::new(),
        });
        builder.parts_emitted = 1;
    }
    let total_parts = raw_parts.len() as u32;
    Ok(raw_parts
        .iter()
        .map(|part| builder.build_packet(part, total_parts, query_context.clone()))
        .collect())
}

/// Final tally for a streaming run, delivered once the producer finishes
/// (or is cancelled).
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub total_parts: u32,
    pub total_rows: u64,
    pub cancelled: bool,
}

/// Streaming mode: drains `row_rx` into size-bounded parts, each emitted on
/// `part_tx` as soon as it fills with `TotalParts = 0` (unknown until the
/// summary arrives on `summary_tx`). Cancellation flushes whatever partial
/// part exists and stops cleanly rather than erroring.
pub async fn generate_stream(
    schema: Schema,
    mut row_rx: mpsc::Receiver<Vec<String>>,
    part_tx: mpsc::Sender<Packet>,
    summary_tx: tokio::sync::oneshot::Sender<StreamSummary>,
    table_name: impl Into<String>,
    header_type: HeaderType,
    base_message_id: impl Into<String>,
    cancel: CancellationToken,
    budget: usize,
) -> Result<()> {
    let mut builder = PacketBuilder::new(schema, table_name, header_type, base_message_id, None).with_budget(budget);
    let mut total_rows: u64 = 0;
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            maybe_row = row_rx.recv() => {
                match maybe_row {
                    Some(row) => {
                        total_rows += 1;
                        if let Some(part) = builder.push_row(row) {
                            let packet = builder.build_packet(&part, 0, None);
                            if part_tx.send(packet).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(part) = builder.finish() {
        let packet = builder.build_packet(&part, 0, None);
        let _ = part_tx.send(packet).await;
    }

    let summary = StreamSummary {
        total_parts: builder.parts_emitted(),
        total_rows,
        cancelled,
    };
    debug!(
        parts = summary.total_parts,
        rows = summary.total_rows,
        cancelled = summary.cancelled,
        "streaming generation finished"
    );
    let _ = summary_tx.send(summary);
    Ok(())
}

/// Post-processes a batch's headers once the caller (having stored parts to
/// files under `_part_<n>` names) learns the final part count, so the
/// streaming path can converge on the same on-disk naming as batched mode.
pub fn finalize_total_parts(packets: &mut [Packet]) -> Result<()> {
    let total = packets.len() as u32;
    if total == 0 {
        return Err(TdtpError::validation("cannot finalize an empty part set"));
    }
    for (i, packet) in packets.iter_mut().enumerate() {
        packet.header.total_parts = Some(total);
        packet.header.part_number = Some((i + 1) as u32);
    }
    Ok(())
}

/// The multi-part file naming convention: `<base>_part_<N>_of_<total><ext>`.
pub fn part_file_name(base: &str, part_number: u32, total_parts: u32, ext: &str) -> String {
    format!("{base}_part_{part_number}_of_{total_parts}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use crate::value::FieldType;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("note", FieldType::Text),
        ])
    }

    #[test]
    fn partitioning_produces_multiple_parts_under_tight_budget() {
        let rows: Vec<Vec<String>> = (0..1000)
            .map(|i| vec![i.to_string(), "x".repeat(40)])
            .collect();
        let packets = generate_batch(
            sample_schema(),
            rows,
            "customers",
            HeaderType::Reference,
            "BATCH-100",
            None,
            None,
            100_000,
        )
        .unwrap();

        assert!(packets.len() >= 2);
        let total_parts = packets.len() as u32;
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.header.part_number, Some((i + 1) as u32));
            assert_eq!(packet.header.total_parts, Some(total_parts));
            assert!(crate::schema::schema_equals(&packet.schema, &packets[0].schema));
        }
        let sum_records: u32 = packets.iter().map(|p| p.header.records_in_part.unwrap()).sum();
        assert_eq!(sum_records, 1000);

        let mut part_numbers: Vec<u32> = packets.iter().map(|p| p.header.part_number.unwrap()).collect();
        part_numbers.sort_unstable();
        let expected: Vec<u32> = (1..=total_parts).collect();
        assert_eq!(part_numbers, expected);
    }

    #[test]
    fn single_small_batch_is_one_part() {
        let rows = vec![vec!["1".to_string(), "a".to_string()]];
        let packets = generate_batch(
            sample_schema(),
            rows,
            "customers",
            HeaderType::Reference,
            "BATCH-200",
            None,
            None,
            DEFAULT_BUDGET_BYTES,
        )
        .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.part_number, Some(1));
        assert_eq!(packets[0].header.total_parts, Some(1));
    }

    #[test]
    fn empty_batch_still_emits_one_self_describing_part() {
        let packets = generate_batch(
            sample_schema(),
            Vec::new(),
            "customers",
            HeaderType::Reference,
            "BATCH-300",
            None,
            None,
            DEFAULT_BUDGET_BYTES,
        )
        .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.rows.len(), 0);
    }

    #[test]
    fn part_file_name_matches_the_chosen_naming_convention() {
        assert_eq!(part_file_name("customers", 2, 5, ".xml"), "customers_part_2_of_5.xml");
    }

    #[tokio::test]
    async fn streaming_emits_parts_and_a_final_summary() {
        let (row_tx, row_rx) = mpsc::channel(16);
        let (part_tx, mut part_rx) = mpsc::channel(16);
        let (summary_tx, summary_rx) = tokio::sync::oneshot::channel();
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(generate_stream(
            sample_schema(),
            row_rx,
            part_tx,
            summary_tx,
            "customers",
            HeaderType::Reference,
            "BATCH-400",
            cancel.clone(),
            200,
        ));

        for i in 0..50 {
            row_tx.send(vec![i.to_string(), "x".repeat(20)]).await.unwrap();
        }
        drop(row_tx);

        let mut collected = Vec::new();
        while let Some(packet) = part_rx.recv().await {
            collected.push(packet);
        }
        producer.await.unwrap().unwrap();
        let summary = summary_rx.await.unwrap();

        assert!(!summary.cancelled);
        assert_eq!(summary.total_rows, 50);
        assert_eq!(collected.len() as u32, summary.total_parts);
        for packet in &collected {
            assert_eq!(packet.header.total_parts, Some(0));
        }
    }

    #[tokio::test]
    async fn cancellation_flushes_the_partial_part_and_reports_it() {
        let (row_tx, row_rx) = mpsc::channel(16);
        let (part_tx, mut part_rx) = mpsc::channel(16);
        let (summary_tx, summary_rx) = tokio::sync::oneshot::channel();
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(generate_stream(
            sample_schema(),
            row_rx,
            part_tx,
            summary_tx,
            "customers",
            HeaderType::Reference,
            "BATCH-450",
            cancel.clone(),
            400,
        ));

        for i in 0..3 {
            row_tx.send(vec![i.to_string(), "y".repeat(30)]).await.unwrap();
        }
        // Wait for at least one part to prove the generator made progress,
        // then cancel mid-stream without closing the row channel.
        let first = part_rx.recv().await.unwrap();
        cancel.cancel();

        let mut collected = vec![first];
        while let Some(packet) = part_rx.recv().await {
            collected.push(packet);
        }
        producer.await.unwrap().unwrap();
        let summary = summary_rx.await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(collected.len() as u32, summary.total_parts);
        let rows_in_parts: u64 = collected.iter().map(|p| p.data.rows.len() as u64).sum();
        assert_eq!(rows_in_parts, summary.total_rows);
    }

    #[test]
    fn query_context_rides_only_on_the_first_part_of_a_response() {
        let rows: Vec<Vec<String>> = (0..200).map(|i| vec![i.to_string(), "x".repeat(40)]).collect();
        let context = QueryContext {
            query: crate::query::Query::new().with_limit(200),
            total: 500,
            after_filter: 200,
            returned: 200,
            more_data_available: true,
            next_offset: Some(200),
            predicate_matches: Vec::new(),
        };
        let packets = generate_batch(
            sample_schema(),
            rows,
            "customers",
            HeaderType::Response,
            "RESP-1",
            Some("REQ-1".to_string()),
            Some(context),
            10_000,
        )
        .unwrap();

        assert!(packets.len() >= 2);
        assert!(packets[0].query_context.is_some());
        assert!(packets[0].query.is_some());
        for packet in &packets[1..] {
            assert!(packet.query_context.is_none());
            assert!(packet.query.is_none());
        }
        for packet in &packets {
            assert_eq!(packet.header.in_reply_to.as_deref(), Some("REQ-1"));
        }
    }

    #[test]
    fn finalize_total_parts_renumbers_streamed_packets() {
        let mut packets = generate_batch(
            sample_schema(),
            vec![vec!["1".to_string(), "a".to_string()]],
            "customers",
            HeaderType::Reference,
            "BATCH-500",
            None,
            None,
            DEFAULT_BUDGET_BYTES,
        )
        .unwrap();
        for p in &mut packets {
            p.header.total_parts = Some(0);
        }
        finalize_total_parts(&mut packets).unwrap();
        assert_eq!(packets[0].header.total_parts, Some(1));
    }
}
