//! PostgreSQL adapter (C8): `information_schema` + `pg_index` introspection,
//! schema-qualified identifiers, NUMERIC handled as text to avoid precision loss.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tdtp_proto::error::{Result, TdtpError};
use tdtp_proto::query::{Dialect, Query};
use tdtp_proto::schema::{Field, Schema};
use tdtp_proto::value::{parse_value, FieldType, TypedValue, ValueConstraints};

use crate::adapter::{Adapter, DialectSqlAdapter, InsertStrategy};
use crate::convert::{db_value_to_wire, typed_value_to_param, DbParam, DbValue};

pub struct PostgresAdapter {
    pool: PgPool,
    db_schema: String,
}

impl PostgresAdapter {
    pub async fn connect(url: &str, db_schema: impl Into<String>) -> Result<Self> {
        let pool = PgPool::connect(url).await.map_err(|e| TdtpError::Connection(e.to_string()))?;
        Ok(PostgresAdapter {
            pool,
            db_schema: db_schema.into(),
        })
    }

    fn quote(ident: &str) -> String {
        format!("\"{ident}\"")
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", Self::quote(&self.db_schema), Self::quote(table))
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn get_table_schema(&self, table: &str) -> Result<Schema> {
        let rows = sqlx::query(
            "SELECT c.column_name, c.data_type, c.udt_name, \
             EXISTS (SELECT 1 FROM pg_index i JOIN pg_attribute a ON a.attnum = ANY(i.indkey) AND a.attrelid = i.indrelid \
                      WHERE i.indrelid = ($1 || '.' || $2)::regclass AND i.indisprimary AND a.attname = c.column_name) AS is_key \
             FROM information_schema.columns c WHERE c.table_schema = $1 AND c.table_name = $2 ORDER BY c.ordinal_position",
        )
        .bind(&self.db_schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TdtpError::Query(e.to_string()))?;

        let mut fields = Vec::new();
        for row in rows {
            let name: String = row.try_get("column_name").map_err(|e| TdtpError::Query(e.to_string()))?;
            let data_type: String = row.try_get("data_type").map_err(|e| TdtpError::Query(e.to_string()))?;
            let udt: String = row.try_get("udt_name").map_err(|e| TdtpError::Query(e.to_string()))?;
            let is_key: bool = row.try_get("is_key").map_err(|e| TdtpError::Query(e.to_string()))?;
            let field_type = pg_type_to_field_type(&data_type, &udt);
            fields.push(Field {
                key: is_key,
                subtype: Some(udt),
                ..Field::new(name, field_type)
            });
        }
        if fields.is_empty() {
            return Err(TdtpError::Query(format!("table '{table}' has no columns or does not exist")));
        }
        Ok(Schema::new(fields))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2")
            .bind(&self.db_schema)
            .bind(table)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", self.qualified(table)))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        let n: i64 = row.try_get("n").map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(n as u64)
    }

    async fn read_all(&self, table: &str, schema: &Schema, include_read_only: bool) -> Result<Vec<Vec<TypedValue>>> {
        let sql = format!("SELECT * FROM {}", self.qualified(table));
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
                let db_value = pg_column_value(&row, &field.name, field.field_type)?;
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
            .map(|f| format!("{} {}{}", Self::quote(&f.name), pg_ddl_type(f), if f.key { " PRIMARY KEY" } else { "" }))
            .collect();
        let sql = format!("CREATE TABLE {} ({})", self.qualified(table), columns.join(", "));
        sqlx::query(&sql).execute(&self.pool).await.map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE {}", self.qualified(table)))
            .execute(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        sqlx::query(&format!("ALTER TABLE {} RENAME TO {}", self.qualified(from), Self::quote(to)))
            .execute(&self.pool)
            .await
            .map_err(|e| TdtpError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_rows(&self, table: &str, schema: &Schema, rows: &[Vec<TypedValue>], strategy: InsertStrategy) -> Result<u64> {
        let columns: Vec<String> = schema.fields.iter().map(|f| Self::quote(&f.name)).collect();
        let placeholders: Vec<String> = (1..=schema.fields.len()).map(|i| format!("${i}")).collect();
        let conflict_clause = match strategy {
            InsertStrategy::Replace => {
                let key_cols: Vec<&str> = schema.fields.iter().filter(|f| f.key).map(|f| f.name.as_str()).collect();
                if key_cols.is_empty() {
                    String::new()
                } else {
                    let updates: Vec<String> = schema
                        .fields
                        .iter()
                        .filter(|f| !f.key)
                        .map(|f| format!("{} = EXCLUDED.{}", Self::quote(&f.name), Self::quote(&f.name)))
                        .collect();
                    format!(" ON CONFLICT ({}) DO UPDATE SET {}", key_cols.join(", "), updates.join(", "))
                }
            }
            InsertStrategy::Ignore => " ON CONFLICT DO NOTHING".to_string(),
            InsertStrategy::Fail | InsertStrategy::Copy => String::new(),
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}){conflict_clause}",
            self.qualified(table),
            columns.join(", "),
            placeholders.join(", ")
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

    fn sql_adapter(&self) -> Option<&dyn DialectSqlAdapter> {
        Some(self)
    }
}

impl DialectSqlAdapter for PostgresAdapter {
    fn adapt(&self, standard_sql: &str, _table: &str, _schema: &Schema, _query: &Query) -> Result<String> {
        // Postgres-generated SQL from the translator already double-quotes
        // identifiers; the only adjustment needed is schema qualification,
        // which `qualified()` already applies to the base table reference.
        Ok(standard_sql.to_string())
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    param: DbParam,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match param {
        DbParam::Null => query.bind(None::<String>),
        DbParam::Bool(b) => query.bind(b),
        DbParam::I64(i) => query.bind(i),
        DbParam::F64(f) => query.bind(f),
        DbParam::Str(s) => query.bind(s),
        DbParam::Bytes(b) => query.bind(b),
        DbParam::Date(d) => query.bind(d),
        DbParam::DateTime(dt) => query.bind(dt),
        DbParam::Timestamp(ts) => query.bind(ts),
    }
}

fn pg_type_to_field_type(data_type: &str, udt: &str) -> FieldType {
    match data_type {
        "integer" | "bigint" | "smallint" => FieldType::Integer,
        "double precision" | "real" => FieldType::Real,
        "numeric" => FieldType::Decimal,
        "boolean" => FieldType::Boolean,
        "date" => FieldType::Date,
        "timestamp without time zone" => FieldType::DateTime,
        "timestamp with time zone" => FieldType::Timestamp,
        "bytea" => FieldType::Blob,
        "uuid" | "json" | "jsonb" => FieldType::Text,
        _ if udt == "uuid" => FieldType::Text,
        _ => FieldType::Text,
    }
}

fn pg_ddl_type(field: &Field) -> &'static str {
    match field.field_type {
        FieldType::Integer => "BIGINT",
        FieldType::Real => "DOUBLE PRECISION",
        FieldType::Decimal => "NUMERIC",
        FieldType::Text => "TEXT",
        FieldType::Boolean => "BOOLEAN",
        FieldType::Date => "DATE",
        FieldType::DateTime => "TIMESTAMP",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::Blob => "BYTEA",
    }
}

fn pg_column_value(row: &sqlx::postgres::PgRow, name: &str, field_type: FieldType) -> Result<DbValue> {
    match field_type {
        FieldType::Integer => opt(row, name, DbValue::I64, |r, n| r.try_get::<Option<i64>, _>(n)),
        FieldType::Boolean => opt(row, name, DbValue::Bool, |r, n| r.try_get::<Option<bool>, _>(n)),
        FieldType::Real => opt(row, name, DbValue::F64, |r, n| r.try_get::<Option<f64>, _>(n)),
        FieldType::Decimal => match row.try_get::<Option<String>, _>(name) {
            Ok(Some(s)) => Ok(DbValue::Numeric(s)),
            Ok(None) => Ok(DbValue::Null),
            Err(_) => opt(row, name, |f: f64| DbValue::Numeric(f.to_string()), |r, n| r.try_get::<Option<f64>, _>(n)),
        },
        FieldType::Blob => opt(row, name, DbValue::Bytes, |r, n| r.try_get::<Option<Vec<u8>>, _>(n)),
        FieldType::Date => opt(row, name, DbValue::Date, |r, n| r.try_get::<Option<chrono::NaiveDate>, _>(n)),
        FieldType::DateTime => opt(row, name, DbValue::DateTime, |r, n| {
            r.try_get::<Option<chrono::NaiveDateTime>, _>(n)
        }),
        FieldType::Timestamp => opt(row, name, DbValue::Timestamp, |r, n| {
            r.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(n)
        }),
        FieldType::Text => opt(row, name, DbValue::Str, |r, n| r.try_get::<Option<String>, _>(n)),
    }
}

fn opt<T>(
    row: &sqlx::postgres::PgRow,
    name: &str,
    wrap: impl Fn(T) -> DbValue,
    get: impl Fn(&sqlx::postgres::PgRow, &str) -> std::result::Result<Option<T>, sqlx::Error>,
) -> Result<DbValue> {
    match get(row, name) {
        Ok(Some(v)) => Ok(wrap(v)),
        Ok(None) => Ok(DbValue::Null),
        Err(e) => Err(TdtpError::Query(e.to_string())),
    }
}
