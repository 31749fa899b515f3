//! Adapter capability set (C7): the single set of operations every
//! per-dialect adapter (C8) implements, so export/import helpers compose
//! as pure functions over this trait rather than duplicating per-driver code.

use async_trait::async_trait;
use tdtp_proto::error::Result;
use tdtp_proto::query::Dialect;
use tdtp_proto::schema::Schema;
use tdtp_proto::value::TypedValue;

/// Import conflict-resolution strategy, selected per import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Overwrite the existing row on key conflict.
    Replace,
    /// Keep the existing row, skip the incoming one.
    Ignore,
    /// Raise `StrategyConflict` on the first conflicting key.
    Fail,
    /// Bulk insert, assuming the destination is empty.
    Copy,
}

/// Dialect-specific SQL rewriting, consulted by the export helper when
/// translating a TDTQL query to SQL (paging syntax, identifier qualification).
pub trait DialectSqlAdapter: Send + Sync {
    /// Rewrites `standard_sql` (a portable baseline produced against
    /// [`Dialect::Postgres`] conventions) for this adapter's dialect.
    fn adapt(&self, standard_sql: &str, table: &str, schema: &Schema, query: &tdtp_proto::query::Query) -> Result<String>;
}

/// The capability set a per-dialect adapter (C8) provides. Export and
/// import helpers are free functions over `&dyn Adapter` — see
/// [`crate::export`] and [`crate::import`].
#[async_trait]
pub trait Adapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Schema introspection for `table`.
    async fn get_table_schema(&self, table: &str) -> Result<Schema>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Fast row count, using a dialect-native shortcut where available
    /// (e.g. MSSQL's `sys.dm_db_partition_stats`) instead of `COUNT(*)`.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Reads every row of `table`. `include_read_only` controls whether
    /// read-only (identity/computed/timestamp) columns are included.
    async fn read_all(&self, table: &str, schema: &Schema, include_read_only: bool) -> Result<Vec<Vec<TypedValue>>>;

    /// Executes an arbitrary, already-dialect-correct `SELECT`/`WITH`
    /// statement and interprets the result against `schema`.
    async fn read_with_sql(&self, sql: &str, schema: &Schema) -> Result<Vec<Vec<TypedValue>>>;

    async fn create_table(&self, table: &str, schema: &Schema) -> Result<()>;
    async fn drop_table(&self, table: &str) -> Result<()>;
    async fn rename_table(&self, from: &str, to: &str) -> Result<()>;

    /// Inserts `rows` into an already-existing `table` under `strategy`,
    /// in its own transaction. Returns the number of rows actually inserted.
    async fn insert_rows(
        &self,
        table: &str,
        schema: &Schema,
        rows: &[Vec<TypedValue>],
        strategy: InsertStrategy,
    ) -> Result<u64>;

    /// The optional dialect SQL rewrite hook; only MSSQL/PostgreSQL/MySQL
    /// adapters return `Some`.
    fn sql_adapter(&self) -> Option<&dyn DialectSqlAdapter> {
        None
    }
}
