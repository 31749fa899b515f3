//! SQLite adapter (C8): PRAGMA-based schema introspection, `"x"` identifier
//! quoting, `INSERT OR REPLACE/IGNORE` for conflict strategies.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::query::Dialect;
use tdtp_proto::schema::{Field, Schema};
use tdtp_proto::value::{FieldType, TypedValue};

use crate::adapter::{Adapter, InsertStrategy};
use crate::convert::{db_value_to_wire, typed_value_to_param, DbParam, DbValue};

pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(SqliteAdapter { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        SqliteAdapter { pool }
    }

    fn quote(ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn ddl_type(field: &Field) -> &'static str {
        match field.field_type {
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Decimal => "TEXT",
            FieldType::Text => "TEXT",
            FieldType::Boolean => "INTEGER",
            FieldType::Date | FieldType::DateTime | FieldType::Timestamp => "TEXT",
            FieldType::Blob => "BLOB",
        }
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn get_table_schema(&self, table: &str) -> Result<Schema> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", Self::quote(table)))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut fields = Vec::new();
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| TdtpError::Query(e.to_string()))?;
            let decl_type: String = row.try_get("type").map_err(|e| TdtpError::Query(e.to_string()))?;
            let key: i64 = row.try_get("pk").map_err(|e| TdtpError::Query(e.to_string()))?;
            let field_type = sqlite_type_to_field_type(&decl_type);
            fields.push(Field {
                key: key > 0,
                ..Field::new(name, field_type)
            });
        }
        if fields.is_empty() {
            return Err(TdtpError::Query(format!("table '{table}' has no columns or does not exist")));
        }
        Ok(Schema::new(fields))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) as n FROM {}", Self::quote(table)))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        let n: i64 = row.try_get("n").map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(n as u64)
    }

    async fn read_all(&self, table: &str, schema: &Schema, include_read_only: bool) -> Result<Vec<Vec<TypedValue>>> {
        let sql = format!("SELECT * FROM {}", Self::quote(table));
        let rows = self.read_with_sql(&sql, schema).await?;
        if include_read_only {
            Ok(rows)
        } else {
            let keep: Vec<usize> = schema
                .fields
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.read_only)
                .map(|(i, _)| i)
                .collect();
            Ok(rows
                .into_iter()
                .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
                .collect())
        }
    }

    async fn read_with_sql(&self, sql: &str, schema: &Schema) -> Result<Vec<Vec<TypedValue>>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(schema.fields.len());
            for field in &schema.fields {
                let db_value = sqlite_column_value(&row, &field.name, field.field_type)?;
                let wire = db_value_to_wire(db_value, field.field_type)?;
                values.push(tdtp_proto::value::parse_value(
                    &wire,
                    &tdtp_proto::value::ValueConstraints {
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
            .map(|f| {
                let pk = if f.key { " PRIMARY KEY" } else { "" };
                format!("{} {}{}", Self::quote(&f.name), Self::ddl_type(f), pk)
            })
            .collect();
        let sql = format!("CREATE TABLE {} ({})", Self::quote(table), columns.join(", "));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE {}", Self::quote(table)))
            .execute(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            Self::quote(from),
            Self::quote(to)
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Vec<TypedValue>],
        strategy: InsertStrategy,
    ) -> Result<u64> {
        let verb = match strategy {
            InsertStrategy::Replace => "INSERT OR REPLACE",
            InsertStrategy::Ignore => "INSERT OR IGNORE",
            InsertStrategy::Fail | InsertStrategy::Copy => "INSERT",
        };
        let columns: Vec<String> = schema.fields.iter().map(|f| Self::quote(&f.name)).collect();
        let placeholders = vec!["?"; schema.fields.len()].join(", ");
        let sql = format!(
            "{verb} INTO {} ({}) VALUES ({})",
            Self::quote(table),
            columns.join(", "),
            placeholders
        );

        let mut tx = self.pool.begin().await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        let mut inserted = 0u64;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for value in row {
                query = bind_param(query, typed_value_to_param(value, true));
            }
            let result = query.execute(&mut *tx).await;
            match result {
                Ok(_) => inserted += 1,
                Err(e) if strategy == InsertStrategy::Fail => {
                    return Err(TdtpError::StrategyConflict {
                        key: format!("{e}"),
                    })
                }
                Err(e) => return Err(TdtpError::Query(e.to_string())),
            }
        }
        tx.commit().await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(inserted)
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    param: DbParam,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match param {
        DbParam::Null => query.bind(None::<String>),
        DbParam::Bool(b) => query.bind(if b { 1i64 } else { 0i64 }),
        DbParam::I64(i) => query.bind(i),
        DbParam::F64(f) => query.bind(f),
        DbParam::Str(s) => query.bind(s),
        DbParam::Bytes(b) => query.bind(b),
        DbParam::Date(d) => query.bind(d.format("%Y-%m-%d").to_string()),
        DbParam::DateTime(dt) => query.bind(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        DbParam::Timestamp(ts) => query.bind(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    }
}

fn sqlite_type_to_field_type(decl: &str) -> FieldType {
    let upper = decl.to_ascii_uppercase();
    if upper.contains("INT") {
        FieldType::Integer
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        FieldType::Real
    } else if upper.contains("BLOB") {
        FieldType::Blob
    } else {
        FieldType::Text
    }
}

fn sqlite_column_value(row: &sqlx::sqlite::SqliteRow, name: &str, field_type: FieldType) -> Result<DbValue> {
    match field_type {
        FieldType::Integer | FieldType::Boolean => match row.try_get::<Option<i64>, _>(name) {
            Ok(Some(i)) => Ok(DbValue::I64(i)),
            Ok(None) => Ok(DbValue::Null),
            Err(e) => Err(TdtpError::Query(e.to_string())),
        },
        FieldType::Real | FieldType::Decimal => match row.try_get::<Option<f64>, _>(name) {
            Ok(Some(f)) => Ok(DbValue::F64(f)),
            Ok(None) => Ok(DbValue::Null),
            Err(_) => match row.try_get::<Option<String>, _>(name) {
                Ok(Some(s)) => Ok(DbValue::Str(s)),
                Ok(None) => Ok(DbValue::Null),
                Err(e) => Err(TdtpError::Query(e.to_string())),
            },
        },
        FieldType::Blob => match row.try_get::<Option<Vec<u8>>, _>(name) {
            Ok(Some(b)) => Ok(DbValue::Bytes(b)),
            Ok(None) => Ok(DbValue::Null),
            Err(e) => Err(TdtpError::Query(e.to_string())),
        },
        FieldType::Text | FieldType::Date | FieldType::DateTime | FieldType::Timestamp => {
            match row.try_get::<Option<String>, _>(name) {
                Ok(Some(s)) => Ok(DbValue::Str(s)),
                Ok(None) => Ok(DbValue::Null),
                Err(e) => Err(TdtpError::Query(e.to_string())),
            }
        }
    }
}
