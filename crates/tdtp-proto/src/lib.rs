//! Protocol core: packet codec, schema/type system, TDTQL, compression and
//! the partitioning/streaming generator.
//!
//! `tdtp-db` and `tdtp-etl` build on top of this crate; nothing here talks
//! to a database, a broker, or a filesystem.

pub mod compress;
pub mod error;
pub mod generator;
pub mod packet;
pub mod query;
pub mod schema;
pub mod value;

pub use error::{Result, TdtpError};
pub use packet::{AlarmDetails, AlarmSeverity, Data, Header, HeaderType, Packet};
pub use schema::{Field, Schema};
pub use value::{FieldType, TypedValue};
