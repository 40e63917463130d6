//! Purpose: Shared local table-directory resolution for the CLI.
//! Exports: `default_table_dir`.
//! Role: Keep CLI defaults in one place.
//! Invariants: Default table directory remains `~/.lookaside/tables`.

use std::path::PathBuf;

pub(crate) fn default_table_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".lookaside").join("tables")
}
