//! MSSQL adapter (C8): `INFORMATION_SCHEMA` columns, `sys.dm_db_partition_stats`
//! for fast row counts, `[x]` identifier quoting, and the only dialect SQL
//! adapter that actually rewrites paging syntax.

use async_trait::async_trait;
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::query::{Dialect, Query};
use tdtp_proto::schema::{Field, Schema};
use tdtp_proto::value::{parse_value, FieldType, TypedValue, ValueConstraints};
use tiberius::{Client, Config, Query as TQuery};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::adapter::{Adapter, DialectSqlAdapter, InsertStrategy};
use crate::convert::{db_value_to_wire, DbValue};

type MssqlClient = Client<Compat<TcpStream>>;

pub struct MssqlAdapter {
    client: Mutex<MssqlClient>,
}

impl MssqlAdapter {
    pub async fn connect(config: Config) -> Result<Self> {
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| TdtpError::Connection(e.to_string()))?;
        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(MssqlAdapter {
            client: Mutex::new(client),
        })
    }

    fn quote(ident: &str) -> String {
        format!("[{ident}]")
    }
}

#[async_trait]
impl Adapter for MssqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    async fn get_table_schema(&self, table: &str) -> Result<Schema> {
        let mut client = self.client.lock().await;
        let mut qy = TQuery::new(
            "SELECT c.COLUMN_NAME, c.DATA_TYPE, \
             COLUMNPROPERTY(object_id(c.TABLE_NAME), c.COLUMN_NAME, 'IsIdentity') AS is_identity, \
             (SELECT COUNT(*) FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE k \
              WHERE k.TABLE_NAME = c.TABLE_NAME AND k.COLUMN_NAME = c.COLUMN_NAME) AS is_key \
             FROM INFORMATION_SCHEMA.COLUMNS c WHERE c.TABLE_NAME = @P1 ORDER BY c.ORDINAL_POSITION",
        );
        qy.bind(table);
        let stream = qy.query(&mut client).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let rows = stream.into_first_result().await.map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut fields = Vec::new();
        for row in rows {
            let name: &str = row.get("COLUMN_NAME").unwrap_or_default();
            let data_type: &str = row.get("DATA_TYPE").unwrap_or_default();
            let is_identity: i32 = row.get("is_identity").unwrap_or(0);
            let is_key: i32 = row.get("is_key").unwrap_or(0);
            let is_rowversion = matches!(data_type, "rowversion" | "timestamp");
            fields.push(Field {
                key: is_key > 0,
                read_only: is_identity != 0 || is_rowversion,
                subtype: Some(data_type.to_string()),
                ..Field::new(name, mssql_type_to_field_type(data_type))
            });
        }
        if fields.is_empty() {
            return Err(TdtpError::Query(format!("table '{table}' has no columns or does not exist")));
        }
        Ok(Schema::new(fields))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut client = self.client.lock().await;
        let mut qy = TQuery::new("SELECT 1 FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = @P1");
        qy.bind(table);
        let stream = qy.query(&mut client).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let rows = stream.into_first_result().await.map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(!rows.is_empty())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let mut client = self.client.lock().await;
        let sql = format!(
            "SELECT SUM(row_count) AS n FROM sys.dm_db_partition_stats \
             WHERE object_id = OBJECT_ID('{}') AND index_id IN (0, 1)",
            Self::quote(table).replace('\'', "''")
        );
        let stream = client.simple_query(sql).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let rows = stream.into_first_result().await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let n: i64 = rows.first().and_then(|r| r.get("n")).unwrap_or(0);
        Ok(n as u64)
    }

    async fn read_all(&self, table: &str, schema: &Schema, include_read_only: bool) -> Result<Vec<Vec<TypedValue>>> {
        let columns: Vec<&str> = schema
            .fields
            .iter()
            .filter(|f| include_read_only || !f.read_only)
            .map(|f| f.name.as_str())
            .collect();
        let quoted: Vec<String> = columns.iter().map(|c| Self::quote(c)).collect();
        let sql = format!("SELECT {} FROM {}", quoted.join(", "), Self::quote(table));
        self.read_with_sql(&sql, schema).await
    }

    async fn read_with_sql(&self, sql: &str, schema: &Schema) -> Result<Vec<Vec<TypedValue>>> {
        let mut client = self.client.lock().await;
        let stream = client.simple_query(sql).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let rows = stream.into_first_result().await.map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(schema.fields.len());
            for field in &schema.fields {
                let db_value = mssql_column_value(row, field)?;
                let wire = db_value_to_wire(db_value, field.field_type)?;
                values.push(parse_value(
                    &wire,
                    &ValueConstraints {
                        field_type: field.field_type,
                        length: field.length,
                        precision: field.precision,
                        scale: field.scale,
                    },
                )?);
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn create_table(&self, table: &str, schema: &Schema) -> Result<()> {
        let columns: Vec<String> = schema
            .fields
            .iter()
            .map(|f| format!("{} {}{}", Self::quote(&f.name), mssql_ddl_type(f), if f.key { " PRIMARY KEY" } else { "" }))
            .collect();
        let sql = format!("CREATE TABLE {} ({})", Self::quote(table), columns.join(", "));
        let mut client = self.client.lock().await;
        client.simple_query(sql).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .simple_query(format!("DROP TABLE {}", Self::quote(table)))
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        // sp_rename resolves a quoted identifier for the current name, but
        // takes the new name literally: brackets there would end up inside
        // the resulting table name. Both sit in string literals, so single
        // quotes are doubled either way.
        let from = Self::quote(from).replace('\'', "''");
        let to = to.replace('\'', "''");
        client
            .simple_query(format!("EXEC sp_rename '{from}', '{to}'"))
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_rows(&self, table: &str, schema: &Schema, rows: &[Vec<TypedValue>], strategy: InsertStrategy) -> Result<u64> {
        let columns: Vec<String> = schema.fields.iter().map(|f| Self::quote(&f.name)).collect();
        let mut client = self.client.lock().await;
        let mut inserted = 0u64;
        for row in rows {
            let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("@P{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                Self::quote(table),
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut qy = TQuery::new(sql);
            for value in row {
                bind_mssql_param(&mut qy, value);
            }
            match qy.execute(&mut *client).await {
                Ok(_) => inserted += 1,
                Err(e) if strategy == InsertStrategy::Fail => return Err(TdtpError::StrategyConflict { key: e.to_string() }),
                Err(e) if strategy == InsertStrategy::Ignore => {
                    tracing::debug!(error = %e, "ignoring row insert conflict under ignore strategy");
                }
                Err(e) => return Err(TdtpError::Query(e.to_string())),
            }
        }
        Ok(inserted)
    }

    fn sql_adapter(&self) -> Option<&dyn DialectSqlAdapter> {
        Some(self)
    }
}

impl DialectSqlAdapter for MssqlAdapter {
    fn adapt(&self, standard_sql: &str, _table: &str, _schema: &Schema, _query: &Query) -> Result<String> {
        // The shared translator (`tdtp_proto::query::translate`) already
        // emits MSSQL's `OFFSET ... FETCH` form and synthesizes a default
        // `ORDER BY` when paging is requested without one, so there's
        // nothing left to rewrite here.
        Ok(standard_sql.to_string())
    }
}

fn bind_mssql_param(qy: &mut TQuery, value: &TypedValue) {
    match value {
        TypedValue::Null => qy.bind(Option::<i64>::None),
        TypedValue::Integer(i) => qy.bind(*i),
        TypedValue::Real(r) => qy.bind(*r),
        TypedValue::Decimal { raw, .. } => qy.bind(raw.clone()),
        TypedValue::Text(s) => qy.bind(s.clone()),
        TypedValue::Boolean(b) => qy.bind(*b),
        TypedValue::Date(d) => qy.bind(d.format("%Y-%m-%d").to_string()),
        TypedValue::DateTime(dt) => qy.bind(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        TypedValue::Timestamp(ts) => qy.bind(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        TypedValue::Blob(b) => qy.bind(b.clone()),
    }
}

fn mssql_type_to_field_type(data_type: &str) -> FieldType {
    match data_type {
        "int" | "bigint" | "smallint" | "tinyint" => FieldType::Integer,
        "float" | "real" => FieldType::Real,
        "decimal" | "numeric" | "money" => FieldType::Decimal,
        "bit" => FieldType::Boolean,
        "date" => FieldType::Date,
        "datetime" | "datetime2" | "smalldatetime" => FieldType::DateTime,
        "datetimeoffset" => FieldType::Timestamp,
        "varbinary" | "binary" | "image" | "rowversion" | "timestamp" => FieldType::Blob,
        _ => FieldType::Text,
    }
}

fn mssql_ddl_type(field: &Field) -> &'static str {
    match field.field_type {
        FieldType::Integer => "BIGINT",
        FieldType::Real => "FLOAT",
        FieldType::Decimal => "DECIMAL(38,10)",
        FieldType::Text => "NVARCHAR(MAX)",
        FieldType::Boolean => "BIT",
        FieldType::Date => "DATE",
        FieldType::DateTime => "DATETIME2",
        FieldType::Timestamp => "DATETIMEOFFSET",
        FieldType::Blob => "VARBINARY(MAX)",
    }
}

fn mssql_column_value(row: &tiberius::Row, field: &Field) -> Result<DbValue> {
    let name = field.name.as_str();
    match field.field_type {
        FieldType::Integer | FieldType::Boolean => {
            Ok(row.get::<i64, _>(name).map(DbValue::I64).unwrap_or(DbValue::Null))
        }
        FieldType::Real => Ok(row.get::<f64, _>(name).map(DbValue::F64).unwrap_or(DbValue::Null)),
        FieldType::Decimal => Ok(row
            .get::<&str, _>(name)
            .map(|s| DbValue::Numeric(s.to_string()))
            .unwrap_or(DbValue::Null)),
        FieldType::Blob => {
            // `rowversion`/`timestamp` columns get leading-zero-trimmed hex,
            // distinguished from ordinary binary which is kept as full hex.
            let is_rowversion = matches!(field.subtype.as_deref(), Some("rowversion") | Some("timestamp"));
            if is_rowversion {
                Ok(row
                    .get::<&[u8], _>(name)
                    .map(|b| DbValue::RowVersion(b.to_vec()))
                    .unwrap_or(DbValue::Null))
            } else {
                Ok(row.get::<&[u8], _>(name).map(|b| DbValue::Bytes(b.to_vec())).unwrap_or(DbValue::Null))
            }
        }
        FieldType::Date => Ok(row
            .get::<chrono::NaiveDate, _>(name)
            .map(DbValue::Date)
            .unwrap_or(DbValue::Null)),
        FieldType::DateTime => Ok(row
            .get::<chrono::NaiveDateTime, _>(name)
            .map(DbValue::DateTime)
            .unwrap_or(DbValue::Null)),
        FieldType::Timestamp => Ok(row
            .get::<chrono::DateTime<chrono::Utc>, _>(name)
            .map(DbValue::Timestamp)
            .unwrap_or(DbValue::Null)),
        FieldType::Text => Ok(row.get::<&str, _>(name).map(|s| DbValue::Str(s.to_string())).unwrap_or(DbValue::Null)),
    }
}
