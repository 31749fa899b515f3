//! Import helper (C7): shadow-table swap over a target table, composed over
//! [`Adapter`]. Multi-part integrity checking lives one layer up in
//! `tdtp-etl`'s import coordinator (C9); by the time rows reach here they
//! are already one validated, schema-consistent set.

use chrono::Utc;
use tdtp_proto::error::Result;
use tdtp_proto::schema::Schema;
use tdtp_proto::value::TypedValue;
use tracing::warn;

use crate::adapter::{Adapter, InsertStrategy};

/// Stages `rows` in a freshly-named temp table, then swaps it over `table`:
///
/// - if `table` exists: rename it to `<table>_old`, rename the temp table to
///   `<table>`, drop `<table>_old` (a failed drop here is logged, not fatal —
///   the old table is left for manual cleanup);
/// - if it does not exist: rename the temp table to `<table>` directly.
///
/// Returns the number of rows inserted into the temp table.
pub async fn shadow_table_swap_import(
    adapter: &dyn Adapter,
    table: &str,
    schema: &Schema,
    rows: &[Vec<TypedValue>],
    strategy: InsertStrategy,
) -> Result<u64> {
    let temp_table = format!("{table}_tmp_{}", Utc::now().format("%Y%m%d%H%M%S%f"));

    adapter.create_table(&temp_table, schema).await?;
    let inserted = match adapter.insert_rows(&temp_table, schema, rows, strategy).await {
        Ok(n) => n,
        Err(e) => {
            // Best-effort cleanup so a failed staging load doesn't leave a
            // temp table behind; the original error is what's surfaced.
            let _ = adapter.drop_table(&temp_table).await;
            return Err(e);
        }
    };

    if adapter.table_exists(table).await? {
        let old_table = format!("{table}_old");
        adapter.rename_table(table, &old_table).await?;
        if let Err(e) = adapter.rename_table(&temp_table, table).await {
            // Put the production table back before surfacing the error, so
            // a half-finished swap never leaves the target missing.
            if let Err(undo) = adapter.rename_table(&old_table, table).await {
                warn!(table = %table, error = %undo, "failed to restore production table after aborted swap");
            }
            let _ = adapter.drop_table(&temp_table).await;
            return Err(e);
        }
        if let Err(e) = adapter.drop_table(&old_table).await {
            warn!(table = %old_table, error = %e, "drop of superseded table failed; left for manual cleanup");
        }
    } else {
        adapter.rename_table(&temp_table, table).await?;
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tdtp_proto::error::TdtpError;
    use tdtp_proto::query::Dialect;

    /// An in-memory stand-in for a real driver, exercising only the control
    /// flow of the swap — real row storage is beside the point here.
    struct FakeAdapter {
        existing_tables: Mutex<Vec<String>>,
        fail_insert: bool,
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }
        async fn get_table_schema(&self, _table: &str) -> Result<Schema> {
            unimplemented!()
        }
        async fn table_exists(&self, table: &str) -> Result<bool> {
            Ok(self.existing_tables.lock().unwrap().iter().any(|t| t == table))
        }
        async fn row_count(&self, _table: &str) -> Result<u64> {
            Ok(0)
        }
        async fn read_all(&self, _table: &str, _schema: &Schema, _include_read_only: bool) -> Result<Vec<Vec<TypedValue>>> {
            Ok(Vec::new())
        }
        async fn read_with_sql(&self, _sql: &str, _schema: &Schema) -> Result<Vec<Vec<TypedValue>>> {
            Ok(Vec::new())
        }
        async fn create_table(&self, table: &str, _schema: &Schema) -> Result<()> {
            self.existing_tables.lock().unwrap().push(table.to_string());
            Ok(())
        }
        async fn drop_table(&self, table: &str) -> Result<()> {
            self.existing_tables.lock().unwrap().retain(|t| t != table);
            Ok(())
        }
        async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
            let mut tables = self.existing_tables.lock().unwrap();
            tables.retain(|t| t != from);
            tables.push(to.to_string());
            Ok(())
        }
        async fn insert_rows(
            &self,
            _table: &str,
            _schema: &Schema,
            rows: &[Vec<TypedValue>],
            _strategy: InsertStrategy,
        ) -> Result<u64> {
            if self.fail_insert {
                Err(TdtpError::validation("insert failed"))
            } else {
                Ok(rows.len() as u64)
            }
        }
    }

    fn schema() -> Schema {
        Schema::new(vec![tdtp_proto::schema::Field::new("id", tdtp_proto::value::FieldType::Integer)])
    }

    #[tokio::test]
    async fn swap_renames_temp_table_over_fresh_target() {
        let adapter = FakeAdapter {
            existing_tables: Mutex::new(Vec::new()),
            fail_insert: false,
        };
        let rows = vec![vec![TypedValue::Integer(1)]];
        let inserted = shadow_table_swap_import(&adapter, "customers", &schema(), &rows, InsertStrategy::Copy)
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(adapter.existing_tables.lock().unwrap().as_slice(), ["customers"]);
    }

    #[tokio::test]
    async fn swap_replaces_existing_target_and_drops_the_old_copy() {
        let adapter = FakeAdapter {
            existing_tables: Mutex::new(vec!["customers".to_string()]),
            fail_insert: false,
        };
        let rows = vec![vec![TypedValue::Integer(1)]];
        shadow_table_swap_import(&adapter, "customers", &schema(), &rows, InsertStrategy::Copy)
            .await
            .unwrap();
        assert_eq!(adapter.existing_tables.lock().unwrap().as_slice(), ["customers"]);
    }

    #[tokio::test]
    async fn failed_insert_cleans_up_temp_table_and_leaves_target_untouched() {
        let adapter = FakeAdapter {
            existing_tables: Mutex::new(vec!["customers".to_string()]),
            fail_insert: true,
        };
        let rows = vec![vec![TypedValue::Integer(1)]];
        let err = shadow_table_swap_import(&adapter, "customers", &schema(), &rows, InsertStrategy::Copy)
            .await
            .unwrap_err();
        assert!(matches!(err, TdtpError::Validation(_)));
        assert_eq!(adapter.existing_tables.lock().unwrap().as_slice(), ["customers"]);
    }
}
