//! Database adapter base (C7) and per-dialect adapters (C8).

pub mod adapter;
pub mod convert;
pub mod export;
pub mod import;

pub mod dialect {
    pub mod mssql;
    pub mod mysql;
    pub mod postgres;
    pub mod sqlite;
}

pub use adapter::{Adapter, DialectSqlAdapter, InsertStrategy};
pub use convert::{db_value_to_wire, typed_value_to_param, DbParam, DbValue};
pub use dialect::mssql::MssqlAdapter;
pub use dialect::mysql::MySqlAdapter;
pub use dialect::postgres::PostgresAdapter;
pub use dialect::sqlite::SqliteAdapter;
pub use export::{dialect_for, export_rows};
pub use import::shadow_table_swap_import;
