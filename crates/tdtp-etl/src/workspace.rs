//! Ephemeral SQL workspace (C11): an in-memory relational engine that
//! registers every loaded source under its own table name and runs one
//! transform query across all of them.
//!
//! There is no stream and no window here: every source is loaded once,
//! registered once, and the transform runs a single time over all of them
//! together.

use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::MemTable;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{SessionConfig, SessionContext};

use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::schema::{Field, Schema};
use tdtp_proto::value::{format_value, FieldType, TypedValue};

fn arrow_type_for(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Integer => DataType::Int64,
        FieldType::Real => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        FieldType::Decimal | FieldType::Text | FieldType::Date | FieldType::DateTime | FieldType::Timestamp | FieldType::Blob => {
            DataType::Utf8
        }
    }
}

fn field_type_for(data_type: &DataType) -> FieldType {
    match data_type {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            FieldType::Integer
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => FieldType::Real,
        DataType::Boolean => FieldType::Boolean,
        _ => FieldType::Text,
    }
}

fn arrow_schema_from(schema: &Schema) -> Arc<ArrowSchema> {
    Arc::new(ArrowSchema::new(
        schema
            .fields
            .iter()
            .map(|f| ArrowField::new(&f.name, arrow_type_for(f.field_type), true))
            .collect::<Vec<_>>(),
    ))
}

fn record_batch_from_rows(schema: &Schema, rows: &[Vec<TypedValue>]) -> Result<RecordBatch> {
    let arrow_schema = arrow_schema_from(schema);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());

    for (idx, field) in schema.fields.iter().enumerate() {
        let array: ArrayRef = match arrow_type_for(field.field_type) {
            DataType::Int64 => Arc::new(Int64Array::from(
                rows.iter()
                    .map(|r| match &r[idx] {
                        TypedValue::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .collect::<Vec<Option<i64>>>(),
            )),
            DataType::Float64 => Arc::new(datafusion::arrow::array::Float64Array::from(
                rows.iter()
                    .map(|r| match &r[idx] {
                        TypedValue::Real(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<Option<f64>>>(),
            )),
            DataType::Boolean => Arc::new(BooleanArray::from(
                rows.iter()
                    .map(|r| match &r[idx] {
                        TypedValue::Boolean(b) => Some(*b),
                        _ => None,
                    })
                    .collect::<Vec<Option<bool>>>(),
            )),
            _ => Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| {
                        if r[idx].is_null() {
                            None
                        } else {
                            Some(format_value(&r[idx]))
                        }
                    })
                    .collect::<Vec<Option<String>>>(),
            )),
        };
        columns.push(array);
    }

    RecordBatch::try_new(arrow_schema, columns).map_err(|e| TdtpError::Other(e.into()))
}

/// Converts a query result batch back into a wire-ready schema and raw
/// (unescaped) field-string rows, the shape [`tdtp_proto::generator`] consumes.
fn rows_from_record_batch(batch: &RecordBatch) -> Result<(Schema, Vec<Vec<String>>)> {
    let arrow_schema = batch.schema();
    let fields: Vec<Field> = arrow_schema
        .fields()
        .iter()
        .map(|f| Field::new(f.name(), field_type_for(f.data_type())))
        .collect();
    let schema = Schema::new(fields);

    let num_rows = batch.num_rows();
    let mut rows: Vec<Vec<String>> = vec![Vec::with_capacity(batch.num_columns()); num_rows];

    for col in batch.columns() {
        let strings = stringify_column(col)?;
        for (row, value) in rows.iter_mut().zip(strings) {
            row.push(value);
        }
    }

    Ok((schema, rows))
}

fn stringify_column(array: &ArrayRef) -> Result<Vec<String>> {
    if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { String::new() } else { a.value(i).to_string() }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<datafusion::arrow::array::Float64Array>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { String::new() } else { a.value(i).to_string() }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<BooleanArray>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { String::new() } else { if a.value(i) { "1" } else { "0" }.to_string() }).collect());
    }
    if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
        return Ok((0..a.len()).map(|i| if a.is_null(i) { String::new() } else { a.value(i).to_string() }).collect());
    }
    Err(TdtpError::validation(format!(
        "workspace result column has unsupported arrow type {:?}",
        array.data_type()
    )))
}

/// The ephemeral relational engine backing one ETL run. Each registered
/// source is single-writer/single-reader: it is written once by the load
/// stage and read only by the transform query.
pub struct Workspace {
    ctx: SessionContext,
}

impl Workspace {
    pub fn new() -> Self {
        Workspace {
            ctx: SessionContext::new(),
        }
    }

    /// Caps the transform engine's working memory at `bytes`.
    pub fn with_memory_limit(bytes: usize) -> Result<Self> {
        let runtime = RuntimeEnvBuilder::new()
            .with_memory_limit(bytes, 1.0)
            .build_arc()
            .map_err(|e| TdtpError::Other(e.into()))?;
        Ok(Workspace {
            ctx: SessionContext::new_with_config_rt(SessionConfig::new(), runtime),
        })
    }

    /// Registers one loaded source's rows under `table_name`, queryable by
    /// the transform SQL. Rows are staged in record batches of `batch_size`
    /// (one batch holding everything when unset).
    pub fn register_source(
        &self,
        table_name: &str,
        schema: &Schema,
        rows: &[Vec<TypedValue>],
        batch_size: Option<usize>,
    ) -> Result<()> {
        let arrow_schema = arrow_schema_from(schema);
        let mut batches = Vec::new();
        if rows.is_empty() {
            batches.push(RecordBatch::new_empty(arrow_schema.clone()));
        } else {
            let chunk = batch_size.unwrap_or(rows.len()).max(1);
            for chunk_rows in rows.chunks(chunk) {
                batches.push(record_batch_from_rows(schema, chunk_rows)?);
            }
        }
        let table = MemTable::try_new(arrow_schema, vec![batches]).map_err(|e| TdtpError::Query(e.to_string()))?;
        self.ctx
            .register_table(table_name, Arc::new(table))
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    /// Runs `sql` against every registered source and returns the result's
    /// inferred schema plus raw field-string rows.
    pub async fn query(&self, sql: &str) -> Result<(Schema, Vec<Vec<String>>)> {
        let df = self.ctx.sql(sql).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let batches = df.collect().await.map_err(|e| TdtpError::Query(e.to_string()))?;

        let Some(first) = batches.first() else {
            return Ok((Schema::new(Vec::new()), Vec::new()));
        };
        let (schema, mut rows) = rows_from_record_batch(first)?;
        for batch in &batches[1..] {
            let (_, more) = rows_from_record_batch(batch)?;
            rows.extend(more);
        }
        Ok((schema, rows))
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_proto::schema::Field;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("id", FieldType::Integer), Field::new("name", FieldType::Text)])
    }

    #[tokio::test]
    async fn transform_sql_joins_across_registered_sources() {
        let ws = Workspace::new();
        ws.register_source(
            "customers",
            &schema(),
            &[
                vec![TypedValue::Integer(1), TypedValue::Text("alice".into())],
                vec![TypedValue::Integer(2), TypedValue::Text("bob".into())],
            ],
            None,
        )
        .unwrap();

        let (result_schema, rows) = ws.query("SELECT id, name FROM customers WHERE id > 1").await.unwrap();
        assert_eq!(result_schema.fields.len(), 2);
        assert_eq!(rows, vec![vec!["2".to_string(), "bob".to_string()]]);
    }

    #[tokio::test]
    async fn transform_can_combine_two_sources() {
        let ws = Workspace::new();
        ws.register_source("a", &schema(), &[vec![TypedValue::Integer(1), TypedValue::Text("x".into())]], None)
            .unwrap();
        ws.register_source("b", &schema(), &[vec![TypedValue::Integer(2), TypedValue::Text("y".into())]], None)
            .unwrap();

        let (_, rows) = ws
            .query("SELECT id, name FROM a UNION ALL SELECT id, name FROM b ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn small_staging_batches_do_not_change_query_results() {
        let ws = Workspace::new();
        let rows: Vec<Vec<TypedValue>> = (0..10)
            .map(|i| vec![TypedValue::Integer(i), TypedValue::Text(format!("n{i}"))])
            .collect();
        ws.register_source("t", &schema(), &rows, Some(3)).unwrap();

        let (_, out) = ws.query("SELECT count(*) AS n FROM t").await.unwrap();
        assert_eq!(out, vec![vec!["10".to_string()]]);
    }

    #[tokio::test]
    async fn empty_source_registers_as_an_empty_table() {
        let ws = Workspace::new();
        ws.register_source("t", &schema(), &[], None).unwrap();
        let (_, out) = ws.query("SELECT id FROM t").await.unwrap();
        assert!(out.is_empty());
    }
}
