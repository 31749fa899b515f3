//! MySQL adapter (C8): `information_schema` + `KEY_COLUMN_USAGE` for primary
//! keys, backtick identifier quoting.

use async_trait::async_trait;
use sqlx::{MySqlPool, Row};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::query::Dialect;
use tdtp_proto::schema::{Field, Schema};
use tdtp_proto::value::{parse_value, FieldType, TypedValue, ValueConstraints};

use crate::adapter::{Adapter, InsertStrategy};
use crate::convert::{db_value_to_wire, typed_value_to_param, DbParam, DbValue};

pub struct MySqlAdapter {
    pool: MySqlPool,
    database: String,
}

impl MySqlAdapter {
    pub async fn connect(url: &str, database: impl Into<String>) -> Result<Self> {
        let pool = MySqlPool::connect(url).await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(MySqlAdapter {
            pool,
            database: database.into(),
        })
    }

    fn quote(ident: &str) -> String {
        format!("`{ident}`")
    }
}

#[async_trait]
impl Adapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn get_table_schema(&self, table: &str) -> Result<Schema> {
        let rows = sqlx::query(
            "SELECT c.COLUMN_NAME, c.DATA_TYPE, \
             (k.COLUMN_NAME IS NOT NULL) AS is_key \
             FROM information_schema.COLUMNS c \
             LEFT JOIN information_schema.KEY_COLUMN_USAGE k \
               ON k.TABLE_SCHEMA = c.TABLE_SCHEMA AND k.TABLE_NAME = c.TABLE_NAME \
               AND k.COLUMN_NAME = c.COLUMN_NAME AND k.CONSTRAINT_NAME = 'PRIMARY' \
             WHERE c.TABLE_SCHEMA = ? AND c.TABLE_NAME = ? ORDER BY c.ORDINAL_POSITION",
        )
        .bind(&self.database)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut fields = Vec::new();
        for row in rows {
            let name: String = row.try_get("COLUMN_NAME").map_err(|e| TdtpError::Query(e.to_string()))?;
            let data_type: String = row.try_get("DATA_TYPE").map_err(|e| TdtpError::Query(e.to_string()))?;
            let is_key: i64 = row.try_get("is_key").map_err(|e| TdtpError::Query(e.to_string()))?;
            fields.push(Field {
                key: is_key != 0,
                ..Field::new(name, mysql_type_to_field_type(&data_type))
            });
        }
        if fields.is_empty() {
            return Err(TdtpError::Query(format!("table '{table}' has no columns or does not exist")));
        }
        Ok(Schema::new(fields))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM information_schema.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?")
            .bind(&self.database)
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", Self::quote(table)))
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
            return Ok(rows);
        }
        let keep: Vec<usize> = schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.read_only)
            .map(|(i, _)| i)
            .collect();
        Ok(rows.into_iter().map(|row| keep.iter().map(|&i| row[i].clone()).collect()).collect())
    }

    async fn read_with_sql(&self, sql: &str, schema: &Schema) -> Result<Vec<Vec<TypedValue>>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(schema.fields.len());
            for field in &schema.fields {
                let db_value = mysql_column_value(&row, &field.name, field.field_type)?;
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
            .map(|f| format!("{} {}{}", Self::quote(&f.name), mysql_ddl_type(f), if f.key { " PRIMARY KEY" } else { "" }))
            .collect();
        let sql = format!("CREATE TABLE {} ({})", Self::quote(table), columns.join(", "));
        sqlx::query(&sql).execute(&self.pool).await.map_err(|e| TdtpError::Query(e.to_string()))?;
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
        sqlx::query(&format!("RENAME TABLE {} TO {}", Self::quote(from), Self::quote(to)))
            .execute(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_rows(&self, table: &str, schema: &Schema, rows: &[Vec<TypedValue>], strategy: InsertStrategy) -> Result<u64> {
        let verb = match strategy {
            InsertStrategy::Ignore => "INSERT IGNORE",
            _ => "INSERT",
        };
        let columns: Vec<String> = schema.fields.iter().map(|f| Self::quote(&f.name)).collect();
        let placeholders = vec!["?"; schema.fields.len()].join(", ");
        let update_clause = if strategy == InsertStrategy::Replace {
            let updates: Vec<String> = schema
                .fields
                .iter()
                .filter(|f| !f.key)
                .map(|f| format!("{} = VALUES({})", Self::quote(&f.name), Self::quote(&f.name)))
                .collect();
            if updates.is_empty() {
                String::new()
            } else {
                format!(" ON DUPLICATE KEY UPDATE {}", updates.join(", "))
            }
        } else {
            String::new()
        };
        let sql = format!(
            "{verb} INTO {} ({}) VALUES ({}){update_clause}",
            Self::quote(table),
            columns.join(", "),
            placeholders
        );

        let mut tx = self.pool.begin().await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        let mut inserted = 0u64;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for value in row {
                query = bind_param(query, typed_value_to_param(value, false));
            }
            match query.execute(&mut *tx).await {
                Ok(_) => inserted += 1,
                Err(e) if strategy == InsertStrategy::Fail => return Err(TdtpError::StrategyConflict { key: e.to_string() }),
                Err(e) => return Err(TdtpError::Query(e.to_string())),
            }
        }
        tx.commit().await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(inserted)
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    param: DbParam,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match param {
        DbParam::Null => query.bind(None::<String>),
        DbParam::Bool(b) => query.bind(b),
        DbParam::I64(i) => query.bind(i),
        DbParam::F64(f) => query.bind(f),
        DbParam::Str(s) => query.bind(s),
        DbParam::Bytes(b) => query.bind(b),
        DbParam::Date(d) => query.bind(d),
        DbParam::DateTime(dt) => query.bind(dt),
        DbParam::Timestamp(ts) => query.bind(ts.naive_utc()),
    }
}

fn mysql_type_to_field_type(data_type: &str) -> FieldType {
    match data_type {
        "int" | "bigint" | "smallint" | "tinyint" | "mediumint" => FieldType::Integer,
        "float" | "double" => FieldType::Real,
        "decimal" => FieldType::Decimal,
        "date" => FieldType::Date,
        "datetime" => FieldType::DateTime,
        "timestamp" => FieldType::Timestamp,
        "blob" | "varbinary" | "binary" => FieldType::Blob,
        _ => FieldType::Text,
    }
}

fn mysql_ddl_type(field: &Field) -> &'static str {
    match field.field_type {
        FieldType::Integer => "BIGINT",
        FieldType::Real => "DOUBLE",
        FieldType::Decimal => "DECIMAL(38,10)",
        FieldType::Text => "TEXT",
        FieldType::Boolean => "TINYINT(1)",
        FieldType::Date => "DATE",
        FieldType::DateTime => "DATETIME",
        FieldType::Timestamp => "TIMESTAMP",
        FieldType::Blob => "BLOB",
    }
}

fn mysql_column_value(row: &sqlx::mysql::MySqlRow, name: &str, field_type: FieldType) -> Result<DbValue> {
    match field_type {
        FieldType::Integer | FieldType::Boolean => opt(row, name, DbValue::I64, |r, n| r.try_get::<Option<i64>, _>(n)),
        FieldType::Real => opt(row, name, DbValue::F64, |r, n| r.try_get::<Option<f64>, _>(n)),
        FieldType::Decimal => opt(row, name, |s: String| DbValue::Numeric(s), |r, n| r.try_get::<Option<String>, _>(n)),
        FieldType::Blob => opt(row, name, DbValue::Bytes, |r, n| r.try_get::<Option<Vec<u8>>, _>(n)),
        FieldType::Date => opt(row, name, DbValue::Date, |r, n| r.try_get::<Option<chrono::NaiveDate>, _>(n)),
        FieldType::DateTime => opt(row, name, DbValue::DateTime, |r, n| {
            r.try_get::<Option<chrono::NaiveDateTime>, _>(n)
        }),
        FieldType::Timestamp => opt(row, name, DbValue::DateTime, |r, n| {
            r.try_get::<Option<chrono::NaiveDateTime>, _>(n)
        }),
        FieldType::Text => opt(row, name, DbValue::Str, |r, n| r.try_get::<Option<String>, _>(n)),
    }
}

fn opt<T>(
    row: &sqlx::mysql::MySqlRow,
    name: &str,
    wrap: impl Fn(T) -> DbValue,
    get: impl Fn(&sqlx::mysql::MySqlRow, &str) -> std::result::Result<Option<T>, sqlx::Error>,
) -> Result<DbValue> {
    match get(row, name) {
        Ok(Some(v)) => Ok(wrap(v)),
        Ok(None) => Ok(DbValue::Null),
        Err(e) => Err(TdtpError::Query(e.to_string())),
    }
}
