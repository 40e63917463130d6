//! Purpose: Describe a table file on disk without opening a connection.
//! Exports: `TableInfo`, `inspect_table`.
//! Role: Backs the CLI `inspect` command; useful for finding stale lookaside tables.
//! Invariants: Read-only; never repairs or rewrites the file.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::error::Error;
use crate::core::table::{TableFile, TableFlags};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TableInfo {
    pub path: PathBuf,
    pub key_format: String,
    pub value_format: String,
    pub flags: Vec<&'static str>,
    pub records: usize,
}

pub fn inspect_table(path: &Path) -> Result<TableInfo, Error> {
    let table = TableFile::open(path)?;
    let header = table.header();
    Ok(TableInfo {
        path: path.to_path_buf(),
        key_format: header.format.key_format.clone(),
        value_format: header.format.value_format.clone(),
        flags: flag_names(header.flags),
        records: table.len(),
    })
}

fn flag_names(flags: TableFlags) -> Vec<&'static str> {
    [
        (TableFlags::LOOKASIDE, "lookaside"),
        (TableFlags::NO_CHECKPOINT, "no_checkpoint"),
        (TableFlags::NO_LOGGING, "no_logging"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::{flag_names, inspect_table};
    use crate::core::error::ErrorKind;
    use crate::core::table::TableFlags;

    #[test]
    fn flag_names_follow_bit_order() {
        assert_eq!(
            flag_names(TableFlags::NO_LOGGING | TableFlags::LOOKASIDE),
            vec!["lookaside", "no_logging"]
        );
        assert!(flag_names(TableFlags::NONE).is_empty());
    }

    #[test]
    fn missing_table_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = inspect_table(&dir.path().join("absent.las")).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
