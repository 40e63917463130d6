//! Purpose: Define the public Rust API boundary for the lookaside store.
//! Exports: Connection, sessions, the lending guard, backends, records, and errors.
//! Role: Public, additive-only surface for embedders and the CLI.
//! Invariants: Everything a caller needs to borrow the lookaside cursor is re-exported here.
//! Invariants: `core` paths may move; downstream code should import from `api`.

mod connection;
mod table_info;

pub use crate::config::{ConnectionConfig, LookasideConfig};
pub use crate::core::backend::{CursorOptions, FileBackend, FileCursor, StorageBackend, TableCursor};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::lookaside::{
    DEFAULT_TABLE_NAME, LookasideCursor, LookasidePresence, LookasideStatsSnapshot, LookasideStore,
};
pub use crate::core::record::{KEY_FORMAT, LookasideValue, TableFormat, VALUE_FORMAT};
pub use crate::core::session::{Session, SessionFlags};
pub use crate::core::table::TableFlags;
pub use connection::{ApiResult, Connection};
pub use table_info::{TableInfo, inspect_table};
