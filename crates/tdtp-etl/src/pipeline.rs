//! Pipeline configuration and the ETL processor (C11): load every source in
//! parallel, stage into the workspace, run one transform query, partition
//! the result, and emit it to the configured sink.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tdtp_db::adapter::Adapter;
use tdtp_io::{KafkaSink, RabbitMqSink, Sink, TdtpFileSink, XlsxSink};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::generator;
use tdtp_proto::packet::{AlarmDetails, AlarmSeverity, Data, Header, HeaderType, Packet};
use tdtp_proto::schema::Schema;
use tdtp_proto::value::TypedValue;

use crate::import_coordinator::validate_multi_part_batch;
use crate::safety::validate_transform_sql;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Postgres,
    Mssql,
    Mysql,
    Sqlite,
    Tdtp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub table: String,
    /// Connection string, consumed by whoever constructs the adapters; the
    /// processor itself never dials a database.
    #[serde(default)]
    pub dsn: Option<String>,
    /// Arbitrary `SELECT`/`WITH` statement run instead of a full table
    /// read. Checked by the safety gate before the run starts.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tdtp_dir: Option<PathBuf>,
    #[serde(default)]
    pub tdtp_base_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorPolicy {
    #[default]
    Fail,
    Continue,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformErrorPolicy {
    #[default]
    Fail,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputErrorPolicy {
    #[default]
    Fail,
    Retry,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub on_source_error: SourceErrorPolicy,
    #[serde(default)]
    pub on_transform_error: TransformErrorPolicy,
    #[serde(default)]
    pub on_output_error: OutputErrorPolicy,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub retry_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    pub sql: String,
    pub result_table: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub unsafe_mode: bool,
    #[serde(default)]
    pub admin_authority: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    Tdtp {
        dir: PathBuf,
        base_name: String,
        extension: String,
        #[serde(default)]
        pretty: bool,
    },
    Rabbitmq {
        uri: String,
        exchange: String,
        queue: String,
        routing_key: String,
    },
    Kafka {
        brokers: String,
        topic: String,
    },
    Xlsx {
        path: String,
        sheet_name: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PerformanceConfig {
    /// Caps how many source loads run at once; unset means all at once.
    #[serde(default)]
    pub max_parallel_sources: Option<usize>,
    /// Rows per staging batch inside the workspace.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Memory cap for the transform engine, in megabytes.
    #[serde(default)]
    pub memory_limit_mb: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression_level")]
    pub level: i32,
    #[serde(default = "default_compression_min_size")]
    pub min_size: usize,
}

fn default_compression_level() -> i32 {
    3
}

fn default_compression_min_size() -> usize {
    tdtp_proto::compress::DEFAULT_MIN_SIZE
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultLogConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub sources: Vec<SourceConfig>,
    pub transform: TransformConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub compression: Option<CompressionConfig>,
    #[serde(default)]
    pub performance: Option<PerformanceConfig>,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandlingConfig>,
    #[serde(default)]
    pub result_log: Option<ResultLogConfig>,
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(text).map_err(|e| TdtpError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks run before any source is touched: unique source
    /// ids, tdtp sources pointing at a directory, and every source query
    /// passing the safety gate (source queries are always safe-mode).
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(TdtpError::config(format!("duplicate source id '{}'", source.id)));
            }
            if source.kind == SourceKind::Tdtp && source.tdtp_dir.is_none() {
                return Err(TdtpError::config(format!("tdtp source '{}' requires tdtp_dir", source.id)));
            }
            if let Some(sql) = &source.query {
                validate_transform_sql(sql, false, false)?;
            }
        }
        Ok(())
    }

    fn error_handling(&self) -> ErrorHandlingConfig {
        self.error_handling.clone().unwrap_or_default()
    }

    fn audit_enabled(&self) -> bool {
        self.audit.as_ref().map(|a| a.enabled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// The result-log JSON shape published after every run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline_name: String,
    pub result_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub rows_loaded: u64,
    pub rows_exported: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where run results go. The processor publishes through this seam without
/// knowing whether the other side is a file, a broker channel, or a keyed
/// store with a TTL.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, result: &PipelineResult) -> Result<()>;
}

/// Built-in publisher: appends one JSON line per run to a local file.
pub struct FileResultLog {
    path: PathBuf,
}

impl FileResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileResultLog { path: path.into() }
    }
}

#[async_trait]
impl ResultPublisher for FileResultLog {
    async fn publish(&self, result: &PipelineResult) -> Result<()> {
        let mut line = serde_json::to_vec(result).map_err(|e| TdtpError::Serialization(e.to_string()))?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| TdtpError::Other(e.into()))?;
        }
        let mut contents = tokio::fs::read(&self.path).await.unwrap_or_default();
        contents.extend_from_slice(&line);
        tokio::fs::write(&self.path, contents).await.map_err(|e| TdtpError::Other(e.into()))?;
        Ok(())
    }
}

/// Constructs the sink named by `output`. Broker sinks connect eagerly so a
/// bad endpoint fails the run before any source is loaded.
pub async fn build_sink(output: &OutputConfig) -> Result<Box<dyn Sink>> {
    Ok(match output {
        OutputConfig::Tdtp {
            dir,
            base_name,
            extension,
            pretty,
        } => Box::new(TdtpFileSink::new(dir.clone(), base_name.clone(), extension.clone(), *pretty)),
        OutputConfig::Rabbitmq {
            uri,
            exchange,
            queue,
            routing_key,
        } => Box::new(RabbitMqSink::connect(uri, exchange.clone(), queue.clone(), routing_key.clone()).await?),
        OutputConfig::Kafka { brokers, topic } => Box::new(KafkaSink::new(brokers, topic.clone())?),
        OutputConfig::Xlsx { path, sheet_name } => Box::new(XlsxSink::new(path.clone(), sheet_name.clone())),
    })
}

async fn load_db_source(adapter: &dyn Adapter, source: &SourceConfig) -> Result<(Schema, Vec<Vec<TypedValue>>)> {
    let schema = adapter.get_table_schema(&source.table).await?;
    let rows = match &source.query {
        Some(sql) => adapter.read_with_sql(sql, &schema).await?,
        None => adapter.read_all(&source.table, &schema, false).await?,
    };
    Ok((schema, rows))
}

/// Loads an already-assembled multi-part batch of TDTP files from disk:
/// every file under `dir` whose name starts with `base_name` is one part.
async fn load_tdtp_source(dir: &Path, base_name: &str) -> Result<(Schema, Vec<Vec<TypedValue>>)> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| TdtpError::Other(e.into()))?;
    let mut packets = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| TdtpError::Other(e.into()))? {
        let path = entry.path();
        let matches = path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with(base_name)).unwrap_or(false);
        if !matches {
            continue;
        }
        let bytes = tokio::fs::read(&path).await.map_err(|e| TdtpError::Other(e.into()))?;
        packets.push(Packet::parse(&bytes)?);
    }
    if packets.is_empty() {
        return Err(TdtpError::validation(format!(
            "no TDTP part files found for '{base_name}' under {}",
            dir.display()
        )));
    }
    packets.sort_by_key(|p| p.header.part_number.unwrap_or(0));
    validate_multi_part_batch(&packets)?;

    let schema = packets[0].schema.clone();
    let mut rows = Vec::new();
    for packet in &packets {
        for raw in packet.decoded_rows()? {
            let fields = tdtp_proto::packet::split_row_fields(&raw);
            rows.push(schema.parse_row(&fields)?);
        }
    }
    Ok((schema, rows))
}

async fn load_one_source(source: &SourceConfig, adapter: Option<&dyn Adapter>) -> Result<(Schema, Vec<Vec<TypedValue>>)> {
    match source.kind {
        SourceKind::Tdtp => {
            let dir = source
                .tdtp_dir
                .as_deref()
                .ok_or_else(|| TdtpError::config("a tdtp source requires tdtp_dir"))?;
            let base = source.tdtp_base_name.as_deref().unwrap_or(&source.table);
            load_tdtp_source(dir, base).await
        }
        _ => {
            let adapter = adapter.ok_or_else(|| TdtpError::config(format!("no adapter supplied for source '{}'", source.id)))?;
            load_db_source(adapter, source).await
        }
    }
}

async fn load_with_timeout(source: &SourceConfig, adapter: Option<&dyn Adapter>) -> Result<(Schema, Vec<Vec<TypedValue>>)> {
    match source.timeout_secs {
        Some(secs) => {
            let budget = Duration::from_secs(secs);
            tokio::time::timeout(budget, load_one_source(source, adapter))
                .await
                .map_err(|_| TdtpError::Timeout(budget))?
        }
        None => load_one_source(source, adapter).await,
    }
}

async fn load_with_policy(
    source: &SourceConfig,
    adapter: Option<&dyn Adapter>,
    error_handling: &ErrorHandlingConfig,
) -> Result<(Schema, Vec<Vec<TypedValue>>)> {
    let attempts = if error_handling.on_source_error == SourceErrorPolicy::Retry {
        error_handling.retry_attempts.max(1)
    } else {
        1
    };
    let mut last_err = None;
    for attempt in 1..=attempts {
        match load_with_timeout(source, adapter).await {
            Ok(loaded) => return Ok(loaded),
            Err(e) => {
                warn!(source = %source.id, attempt, error = %e, "source load attempt failed");
                last_err = Some(e);
                if attempt < attempts && error_handling.retry_delay_seconds > 0 {
                    tokio::time::sleep(Duration::from_secs(error_handling.retry_delay_seconds)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(TdtpError::Cancelled))
}

/// Runs one pipeline execution end to end. Adapters are supplied
/// pre-connected, keyed by source id — each worker owns its adapter
/// exclusively for the duration of its load, never shared across sources.
/// The run result is always published through `result_log` (when given),
/// success or failure alike.
pub async fn run_pipeline(
    config: &PipelineConfig,
    adapters: &HashMap<String, Box<dyn Adapter>>,
    sink: &mut dyn Sink,
    result_log: Option<&dyn ResultPublisher>,
) -> Result<PipelineResult> {
    let started_at = Utc::now();
    let result_name = format!("{}-{}", config.name, started_at.format("%Y%m%d%H%M%S"));

    let outcome = run_pipeline_inner(config, adapters, sink).await;
    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

    let result = match outcome {
        Ok((rows_loaded, rows_exported)) => PipelineResult {
            pipeline_name: config.name.clone(),
            result_name,
            status: RunStatus::Success,
            started_at,
            finished_at,
            duration_ms,
            rows_loaded,
            rows_exported,
            error: None,
        },
        Err(e) => {
            let alarm = alarm_packet(&config.name, &e);
            // Best effort: a sink that can't take an alarm packet either is
            // already broken for the reason the alarm describes, or isn't
            // worth failing the whole run a second time over.
            let _ = sink.write_part(&alarm).await;
            PipelineResult {
                pipeline_name: config.name.clone(),
                result_name,
                status: RunStatus::Failed,
                started_at,
                finished_at,
                duration_ms,
                rows_loaded: 0,
                rows_exported: 0,
                error: Some(e.to_string()),
            }
        }
    };

    if let Some(publisher) = result_log {
        publisher.publish(&result).await?;
    } else if let Some(cfg) = &config.result_log {
        FileResultLog::new(&cfg.path).publish(&result).await?;
    }

    Ok(result)
}

/// Builds the alarm packet sent to the sink when a run fails, so a
/// downstream consumer gets a diagnosable record instead of silence.
fn alarm_packet(pipeline_name: &str, error: &TdtpError) -> Packet {
    let severity = match error {
        TdtpError::Permission(_) | TdtpError::Validation(_) => AlarmSeverity::Warning,
        TdtpError::Cancelled | TdtpError::Timeout(_) => AlarmSeverity::Error,
        _ => AlarmSeverity::Critical,
    };
    Packet {
        version: "1.0".to_string(),
        header: Header {
            header_type: HeaderType::Alarm,
            table_name: pipeline_name.to_string(),
            message_id: format!("{pipeline_name}-ALARM"),
            in_reply_to: None,
            part_number: None,
            total_parts: None,
            records_in_part: None,
            timestamp: Utc::now(),
            sender: None,
            recipient: None,
        },
        query: None,
        query_context: None,
        schema: Schema::new(Vec::new()),
        data: Data::default(),
        alarm_details: Some(AlarmDetails {
            code: error_code(error).to_string(),
            message: error.to_string(),
            severity,
        }),
    }
}

fn error_code(error: &TdtpError) -> &'static str {
    match error {
        TdtpError::Config(_) => "CONFIG",
        TdtpError::Validation(_) => "VALIDATION",
        TdtpError::Connection(_) => "CONNECTION",
        TdtpError::Query(_) => "QUERY",
        TdtpError::Serialization(_) => "SERIALIZATION",
        TdtpError::Compression(_) => "COMPRESSION",
        TdtpError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
        TdtpError::MultiPartIntegrity(_) => "MULTI_PART_INTEGRITY",
        TdtpError::StrategyConflict { .. } => "STRATEGY_CONFLICT",
        TdtpError::Cancelled => "CANCELLED",
        TdtpError::Timeout(_) => "TIMEOUT",
        TdtpError::Permission(_) => "PERMISSION",
        TdtpError::Other(_) => "OTHER",
    }
}

fn make_workspace(performance: Option<&PerformanceConfig>) -> Result<Workspace> {
    match performance.and_then(|p| p.memory_limit_mb) {
        Some(mb) => Workspace::with_memory_limit(mb * 1024 * 1024),
        None => Ok(Workspace::new()),
    }
}

async fn run_pipeline_inner(
    config: &PipelineConfig,
    adapters: &HashMap<String, Box<dyn Adapter>>,
    sink: &mut dyn Sink,
) -> Result<(u64, u64)> {
    config.validate()?;
    validate_transform_sql(&config.transform.sql, config.transform.unsafe_mode, config.transform.admin_authority)?;
    let error_handling = config.error_handling();
    let audit = config.audit_enabled();

    // Load stage: one cooperative worker per source, capped when the
    // performance config asks for it.
    let parallelism = config
        .performance
        .as_ref()
        .and_then(|p| p.max_parallel_sources)
        .unwrap_or_else(|| config.sources.len())
        .max(1);
    let loaded: Vec<(&SourceConfig, Result<(Schema, Vec<Vec<TypedValue>>)>)> =
        stream::iter(config.sources.iter().map(|source| {
            let adapter = adapters.get(&source.id).map(|b| b.as_ref());
            let error_handling = &error_handling;
            async move { (source, load_with_policy(source, adapter, error_handling).await) }
        }))
        .buffer_unordered(parallelism)
        .collect()
        .await;

    let workspace = make_workspace(config.performance.as_ref())?;
    let batch_size = config.performance.as_ref().and_then(|p| p.batch_size);
    let mut rows_loaded = 0u64;
    for (source, result) in loaded {
        match result {
            Ok((schema, rows)) => {
                rows_loaded += rows.len() as u64;
                if audit {
                    info!(target: "tdtp::audit", source = %source.id, rows = rows.len(), "source staged");
                }
                workspace.register_source(&source.id, &schema, &rows, batch_size)?;
            }
            Err(e) => match error_handling.on_source_error {
                SourceErrorPolicy::Fail => return Err(e),
                SourceErrorPolicy::Continue | SourceErrorPolicy::Retry => {
                    // The source's schema is unknown after a failed load, so
                    // there is no empty table to stage in its place; the
                    // transform fails if it still references this alias.
                    warn!(source = %source.id, error = %e, "source excluded from this run per its error policy");
                }
            },
        }
    }

    // Transform stage.
    let transform_outcome = match config.transform.timeout_secs {
        Some(secs) => {
            let budget = Duration::from_secs(secs);
            tokio::time::timeout(budget, workspace.query(&config.transform.sql))
                .await
                .map_err(|_| TdtpError::Timeout(budget))
                .and_then(|r| r)
        }
        None => workspace.query(&config.transform.sql).await,
    };
    let (result_schema, result_rows) = match transform_outcome {
        Ok(result) => result,
        Err(e) => match error_handling.on_transform_error {
            TransformErrorPolicy::Fail => return Err(e),
            TransformErrorPolicy::Continue => {
                warn!(error = %e, "transform failed; continuing with an empty result per policy");
                return Ok((rows_loaded, 0));
            }
        },
    };
    let rows_exported = result_rows.len() as u64;
    if audit {
        info!(target: "tdtp::audit", rows = rows_exported, "transform complete");
    }

    // Emit stage.
    let mut packets = generator::generate_batch(
        result_schema,
        result_rows,
        config.transform.result_table.clone(),
        HeaderType::Reference,
        format!("{}-RESULT", config.name),
        None,
        None,
        generator::DEFAULT_BUDGET_BYTES,
    )?;
    if let Some(compression) = &config.compression {
        for packet in &mut packets {
            packet.compress_data(compression.level, compression.min_size)?;
        }
    }

    for packet in &packets {
        emit_with_policy(sink, packet, &error_handling).await?;
    }
    sink.finish().await?;
    if audit {
        info!(target: "tdtp::audit", parts = packets.len(), "emit complete");
    }

    Ok((rows_loaded, rows_exported))
}

async fn emit_with_policy(sink: &mut dyn Sink, packet: &Packet, error_handling: &ErrorHandlingConfig) -> Result<()> {
    let attempts = if error_handling.on_output_error == OutputErrorPolicy::Retry {
        error_handling.retry_attempts.max(1)
    } else {
        1
    };
    let mut last_err = None;
    for attempt in 1..=attempts {
        match sink.write_part(packet).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "sink write attempt failed");
                last_err = Some(e);
                if attempt < attempts && error_handling.retry_delay_seconds > 0 {
                    tokio::time::sleep(Duration::from_secs(error_handling.retry_delay_seconds)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or(TdtpError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tdtp_db::adapter::InsertStrategy;
    use tdtp_db::dialect::sqlite::SqliteAdapter;
    use tdtp_proto::schema::Field;
    use tdtp_proto::value::FieldType;

    fn base_yaml(extra: &str) -> String {
        format!(
            r#"
name: orders_etl
version: "1.0"
sources:
  - id: orders_db
    type: sqlite
    table: orders
transform:
  sql: "SELECT * FROM orders_db"
  result_table: orders_result
output:
  type: tdtp
  dir: /tmp/out
  base_name: orders
  extension: ".xml"
{extra}"#
        )
    }

    #[test]
    fn pipeline_config_parses_from_yaml() {
        let config = PipelineConfig::from_yaml(&base_yaml("")).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].kind, SourceKind::Sqlite);
        assert!(matches!(config.output, OutputConfig::Tdtp { .. }));
        // Unset error handling falls back to fail-fast everywhere.
        let eh = config.error_handling();
        assert_eq!(eh.on_source_error, SourceErrorPolicy::Fail);
        assert_eq!(eh.on_transform_error, TransformErrorPolicy::Fail);
        assert_eq!(eh.on_output_error, OutputErrorPolicy::Fail);
    }

    #[test]
    fn error_handling_block_parses() {
        let config = PipelineConfig::from_yaml(&base_yaml(
            r#"error_handling:
  on_source_error: retry
  on_transform_error: continue
  on_output_error: retry
  retry_attempts: 3
  retry_delay_seconds: 5
"#,
        ))
        .unwrap();
        let eh = config.error_handling();
        assert_eq!(eh.on_source_error, SourceErrorPolicy::Retry);
        assert_eq!(eh.on_transform_error, TransformErrorPolicy::Continue);
        assert_eq!(eh.retry_attempts, 3);
        assert_eq!(eh.retry_delay_seconds, 5);
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let yaml = r#"
name: dupes
version: "1.0"
sources:
  - id: a
    type: sqlite
    table: t1
  - id: a
    type: sqlite
    table: t2
transform:
  sql: "SELECT * FROM a"
  result_table: r
output:
  type: tdtp
  dir: /tmp/out
  base_name: r
  extension: ".xml"
"#;
        let err = PipelineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TdtpError::Config(_)));
    }

    #[test]
    fn non_select_source_query_is_rejected_by_the_safety_gate() {
        let yaml = r#"
name: bad_source_query
version: "1.0"
sources:
  - id: a
    type: sqlite
    table: t1
    query: "DELETE FROM t1"
transform:
  sql: "SELECT * FROM a"
  result_table: r
output:
  type: tdtp
  dir: /tmp/out
  base_name: r
  extension: ".xml"
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    struct NullSink;

    #[async_trait]
    impl Sink for NullSink {
        async fn write_part(&mut self, _packet: &Packet) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unsafe_transform_sql_without_admin_authority_fails_before_touching_the_workspace() {
        let yaml = r#"
name: bad_pipeline
version: "1.0"
sources: []
transform:
  sql: "DROP TABLE orders"
  result_table: orders_result
output:
  type: tdtp
  dir: /tmp/out
  base_name: orders
  extension: ".xml"
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let adapters = HashMap::new();
        let mut sink = NullSink;
        let result = run_pipeline(&config, &adapters, &mut sink, None).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.is_some());
    }

    async fn sqlite_adapter_with_orders() -> SqliteAdapter {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let adapter = SqliteAdapter::new(pool);
        let schema = Schema::new(vec![
            Field {
                key: true,
                ..Field::new("id", FieldType::Integer)
            },
            Field::new("item", FieldType::Text),
        ]);
        adapter.create_table("orders", &schema).await.unwrap();
        let rows = vec![
            vec![TypedValue::Integer(1), TypedValue::Text("widget".into())],
            vec![TypedValue::Integer(2), TypedValue::Text("gadget".into())],
            vec![TypedValue::Integer(3), TypedValue::Text("sprocket".into())],
        ];
        adapter.insert_rows("orders", &schema, &rows, InsertStrategy::Copy).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn sqlite_to_file_pipeline_runs_end_to_end() {
        let out_dir = tempfile::tempdir().unwrap();
        let log_path = out_dir.path().join("results.jsonl");
        let yaml = format!(
            r#"
name: orders_etl
version: "1.0"
sources:
  - id: orders_db
    type: sqlite
    table: orders
transform:
  sql: "SELECT id, item FROM orders_db WHERE id > 1 ORDER BY id"
  result_table: orders_filtered
output:
  type: tdtp
  dir: {out}
  base_name: orders
  extension: ".xml"
"#,
            out = out_dir.path().display()
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();

        let mut adapters: HashMap<String, Box<dyn Adapter>> = HashMap::new();
        adapters.insert("orders_db".to_string(), Box::new(sqlite_adapter_with_orders().await));

        let mut sink = build_sink(&config.output).await.unwrap();
        let publisher = FileResultLog::new(&log_path);
        let result = run_pipeline(&config, &adapters, sink.as_mut(), Some(&publisher)).await.unwrap();

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.rows_loaded, 3);
        assert_eq!(result.rows_exported, 2);

        let part = out_dir.path().join("orders_part_1_of_1.xml");
        let packet = Packet::parse(&std::fs::read(part).unwrap()).unwrap();
        assert_eq!(packet.header.table_name, "orders_filtered");
        assert_eq!(packet.data.rows, vec!["2|gadget".to_string(), "3|sprocket".to_string()]);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("\"status\":\"success\""));
        assert!(log.contains("\"rows_exported\":2"));
    }

    #[tokio::test]
    async fn failed_source_under_continue_policy_is_skipped() {
        let out_dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
name: partial_etl
version: "1.0"
sources:
  - id: orders_db
    type: sqlite
    table: orders
  - id: missing_db
    type: sqlite
    table: nothing
transform:
  sql: "SELECT id FROM orders_db"
  result_table: orders_only
output:
  type: tdtp
  dir: {out}
  base_name: partial
  extension: ".xml"
error_handling:
  on_source_error: continue
"#,
            out = out_dir.path().display()
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();

        // No adapter registered for missing_db: its load fails, the policy
        // says continue, and the transform only references the good source.
        let mut adapters: HashMap<String, Box<dyn Adapter>> = HashMap::new();
        adapters.insert("orders_db".to_string(), Box::new(sqlite_adapter_with_orders().await));

        let mut sink = build_sink(&config.output).await.unwrap();
        let result = run_pipeline(&config, &adapters, sink.as_mut(), None).await.unwrap();
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.rows_loaded, 3);
        assert_eq!(result.rows_exported, 3);
    }

    #[tokio::test]
    async fn tdtp_file_source_feeds_a_second_pipeline() {
        let stage_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        // First pipeline: database -> part files.
        let yaml = format!(
            r#"
name: stage_one
version: "1.0"
sources:
  - id: orders_db
    type: sqlite
    table: orders
transform:
  sql: "SELECT id, item FROM orders_db"
  result_table: orders_copy
output:
  type: tdtp
  dir: {out}
  base_name: staged
  extension: ".xml"
"#,
            out = stage_dir.path().display()
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();
        let mut adapters: HashMap<String, Box<dyn Adapter>> = HashMap::new();
        adapters.insert("orders_db".to_string(), Box::new(sqlite_adapter_with_orders().await));
        let mut sink = build_sink(&config.output).await.unwrap();
        run_pipeline(&config, &adapters, sink.as_mut(), None).await.unwrap();

        // Second pipeline: those part files as a tdtp source.
        let yaml = format!(
            r#"
name: stage_two
version: "1.0"
sources:
  - id: staged
    type: tdtp
    table: staged
    tdtp_dir: {dir}
    tdtp_base_name: staged
transform:
  sql: "SELECT count(*) AS n FROM staged"
  result_table: staged_count
output:
  type: tdtp
  dir: {out}
  base_name: counted
  extension: ".xml"
"#,
            dir = stage_dir.path().display(),
            out = out_dir.path().display()
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();
        let adapters: HashMap<String, Box<dyn Adapter>> = HashMap::new();
        let mut sink = build_sink(&config.output).await.unwrap();
        let result = run_pipeline(&config, &adapters, sink.as_mut(), None).await.unwrap();

        assert_eq!(result.status, RunStatus::Success);
        let part = out_dir.path().join("counted_part_1_of_1.xml");
        let packet = Packet::parse(&std::fs::read(part).unwrap()).unwrap();
        assert_eq!(packet.data.rows, vec!["3".to_string()]);
    }
}
