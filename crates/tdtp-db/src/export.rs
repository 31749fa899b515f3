//! Export helper (C7): pure functions composed over [`Adapter`], shared by
//! every dialect rather than duplicated per driver.

use tdtp_proto::error::Result;
use tdtp_proto::query::{translate, Dialect, Query, QueryContext};
use tdtp_proto::schema::Schema;
use tdtp_proto::value::TypedValue;

use crate::adapter::Adapter;

/// Reads `table` through `adapter`, applying `query` via SQL pushdown when
/// translatable and falling back to a full read + in-memory execution
/// otherwise.
pub async fn export_rows(
    adapter: &dyn Adapter,
    table: &str,
    schema: &Schema,
    query: Option<&Query>,
    include_read_only: bool,
) -> Result<(Vec<Vec<TypedValue>>, Option<QueryContext>)> {
    let Some(query) = query else {
        let rows = adapter.read_all(table, schema, include_read_only).await?;
        return Ok((rows, None));
    };

    match translate(query, table, schema, adapter.dialect()) {
        Ok(mut sql) => {
            if let Some(sql_adapter) = adapter.sql_adapter() {
                sql = sql_adapter.adapt(&sql, table, schema, query)?;
            }
            let rows = adapter.read_with_sql(&sql, schema).await?;
            let returned = rows.len();
            let total = adapter.row_count(table).await?;
            let context = QueryContext {
                query: query.clone(),
                total: total as usize,
                after_filter: returned,
                returned,
                more_data_available: false,
                next_offset: None,
                predicate_matches: Vec::new(),
            };
            Ok((rows, Some(context)))
        }
        Err(_untranslatable) => {
            // Fall back to a full read plus in-memory filter execution; the
            // SQL translator's failure is expected, not fatal.
            let all = adapter.read_all(table, schema, include_read_only).await?;
            let (filtered, context) = tdtp_proto::query::execute(query, schema, &all)?;
            let filtered = filtered.into_iter().cloned().collect();
            Ok((filtered, Some(context)))
        }
    }
}

/// The export-side portion of a dialect SQL rewrite: MSSQL paging and
/// default `ORDER BY`, PostgreSQL schema qualification, MySQL backtick
/// quoting are all implemented as [`crate::adapter::DialectSqlAdapter`]
/// hooks; this just picks the dialect to translate for.
pub fn dialect_for(name: &str) -> Option<Dialect> {
    Some(match name {
        "sqlite" | "tdtp" => Dialect::Sqlite,
        "postgres" | "postgresql" => Dialect::Postgres,
        "mysql" => Dialect::MySql,
        "mssql" | "sqlserver" => Dialect::Mssql,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, InsertStrategy};
    use crate::dialect::sqlite::SqliteAdapter;
    use sqlx::sqlite::SqlitePoolOptions;
    use tdtp_proto::query::ast::{CompareOp, Filter, FilterNode, OrderKey};
    use tdtp_proto::schema::Field;
    use tdtp_proto::value::{FieldType, TypedValue};

    async fn adapter_with_rows() -> SqliteAdapter {
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
            Field::new("name", FieldType::Text),
        ]);
        adapter.create_table("people", &schema).await.unwrap();
        let rows = vec![
            vec![TypedValue::Integer(1), TypedValue::Text("alice".into())],
            vec![TypedValue::Integer(2), TypedValue::Text("bob".into())],
            vec![TypedValue::Integer(3), TypedValue::Text("carol".into())],
            vec![TypedValue::Integer(4), TypedValue::Text("dave".into())],
        ];
        adapter
            .insert_rows("people", &schema, &rows, InsertStrategy::Copy)
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn pushdown_and_in_memory_execution_agree() {
        let adapter = adapter_with_rows().await;
        let schema = adapter.get_table_schema("people").await.unwrap();
        let query = Query::new()
            .with_filters(FilterNode::Leaf(Filter::new("id", CompareOp::Gt, Some("1".into()))))
            .with_order_by(vec![OrderKey::desc("id")])
            .with_limit(2);

        let (pushed, context) = export_rows(&adapter, "people", &schema, Some(&query), false).await.unwrap();
        assert_eq!(context.unwrap().total, 4);

        let all = adapter.read_all("people", &schema, false).await.unwrap();
        let (in_memory, _) = tdtp_proto::query::execute(&query, &schema, &all).unwrap();
        let in_memory: Vec<Vec<TypedValue>> = in_memory.into_iter().cloned().collect();
        assert_eq!(pushed, in_memory);
    }

    #[tokio::test]
    async fn untranslatable_query_falls_back_to_in_memory_execution() {
        let adapter = adapter_with_rows().await;
        let schema = adapter.get_table_schema("people").await.unwrap();
        // A LIKE next to a range comparison in one OR group has no portable
        // SQL form, so the export helper must take the in-memory path.
        let query = Query::new().with_filters(FilterNode::or(vec![
            FilterNode::Leaf(Filter::new("name", CompareOp::Like, Some("a%".into()))),
            FilterNode::Leaf(Filter::new("id", CompareOp::Ge, Some("4".into()))),
        ]));

        let (rows, context) = export_rows(&adapter, "people", &schema, Some(&query), false).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Predicate tallies only exist on the in-memory path, so their
        // presence proves the fallback actually ran.
        assert!(!context.unwrap().predicate_matches.is_empty());
    }
}
