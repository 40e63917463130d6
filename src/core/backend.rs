//! Purpose: Storage collaborator seam consumed by the lookaside store, plus a file-backed implementation.
//! Exports: `StorageBackend`, `TableCursor`, `CursorOptions`, `FileBackend`, `FileCursor`.
//! Role: Table create/drop, cursor open, and table attributes; the store never touches files directly.
//! Invariants: `drop_table(force = true)` tolerates a missing table.
//! Invariants: Cursors opened with `overwrite = false` reject duplicate inserts and missing removes.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{self, LookasideValue, Record, TableFormat};
use crate::core::session::Session;
use crate::core::table::{self, TableFile, TableFlags};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CursorOptions {
    /// When false, inserting an existing key or removing a missing one is an error.
    pub overwrite: bool,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

/// A positioned handle on one table.
pub trait TableCursor: Send {
    fn insert(&mut self, key: &[u8], value: &LookasideValue) -> Result<(), Error>;
    /// Positions the cursor on `key` when found.
    fn search(&mut self, key: &[u8]) -> Result<Option<LookasideValue>, Error>;
    fn remove(&mut self, key: &[u8]) -> Result<(), Error>;
    /// Steps to the next entry after the current position.
    fn next(&mut self) -> Result<Option<(Vec<u8>, LookasideValue)>, Error>;
    /// Clears the position and any in-flight operation state.
    fn reset(&mut self) -> Result<(), Error>;
}

pub trait StorageBackend: Send + Sync {
    type Cursor: TableCursor;

    fn create_table(&self, name: &str, format: &TableFormat) -> Result<(), Error>;
    fn drop_table(&self, name: &str, force: bool) -> Result<(), Error>;
    fn open_cursor(
        &self,
        session: &Session,
        name: &str,
        options: CursorOptions,
    ) -> Result<Self::Cursor, Error>;
    fn set_table_flags(&self, name: &str, flags: TableFlags) -> Result<(), Error>;
    /// Closes a session along with the cursor opened through it, if any.
    fn close_session(&self, session: Session, cursor: Option<Self::Cursor>) -> Result<(), Error>;
}

type SharedTable = Arc<Mutex<TableFile>>;

/// Tables as files under one directory; open tables are shared between cursors.
pub struct FileBackend {
    dir: PathBuf,
    tables: Mutex<HashMap<String, SharedTable>>,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_path(&self, name: &str) -> Result<PathBuf, Error> {
        validate_table_name(name)?;
        Ok(self.dir.join(name))
    }

    fn shared(&self, name: &str) -> Result<SharedTable, Error> {
        let path = self.table_path(name)?;
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(name) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(Mutex::new(
            TableFile::open(&path).map_err(|err| err.with_table(name))?,
        ));
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }
}

fn validate_table_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("table name must be a plain file name")
            .with_table(name));
    }
    Ok(())
}

impl StorageBackend for FileBackend {
    type Cursor = FileCursor;

    fn create_table(&self, name: &str, format: &TableFormat) -> Result<(), Error> {
        let path = self.table_path(name)?;
        let mut tables = self.tables.lock();
        if tables.contains_key(name) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("table already exists")
                .with_table(name));
        }
        let table = TableFile::create(&path, format).map_err(|err| err.with_table(name))?;
        tables.insert(name.to_string(), Arc::new(Mutex::new(table)));
        debug!(table = name, path = %path.display(), "table created");
        Ok(())
    }

    fn drop_table(&self, name: &str, force: bool) -> Result<(), Error> {
        let path = self.table_path(name)?;
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(name) {
            if !force && Arc::strong_count(table) > 1 {
                return Err(Error::new(ErrorKind::Busy)
                    .with_message("table has open cursors")
                    .with_table(name));
            }
        }
        tables.remove(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(table = name, force, "table dropped");
                Ok(())
            }
            Err(err) if force && err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(table::io_error(&path, err).with_table(name)),
        }
    }

    fn open_cursor(
        &self,
        session: &Session,
        name: &str,
        options: CursorOptions,
    ) -> Result<FileCursor, Error> {
        let table = self.shared(name)?;
        debug!(table = name, session = session.id(), overwrite = options.overwrite, "cursor opened");
        Ok(FileCursor {
            table,
            name: name.to_string(),
            session_id: session.id(),
            overwrite: options.overwrite,
            position: None,
        })
    }

    fn set_table_flags(&self, name: &str, flags: TableFlags) -> Result<(), Error> {
        let table = self.shared(name)?;
        let mut table = table.lock();
        table.set_flags(flags).map_err(|err| err.with_table(name))
    }

    fn close_session(&self, session: Session, cursor: Option<FileCursor>) -> Result<(), Error> {
        let result = match cursor {
            Some(cursor) => cursor.close(),
            None => Ok(()),
        };
        debug!(session = session.id(), name = session.name(), "session closed");
        result
    }
}

pub struct FileCursor {
    table: SharedTable,
    name: String,
    session_id: u64,
    overwrite: bool,
    position: Option<Vec<u8>>,
}

impl FileCursor {
    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn position(&self) -> Option<&[u8]> {
        self.position.as_deref()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    fn close(self) -> Result<(), Error> {
        let table = self.table.lock();
        table.sync().map_err(|err| err.with_table(&self.name))
    }
}

impl TableCursor for FileCursor {
    fn insert(&mut self, key: &[u8], value: &LookasideValue) -> Result<(), Error> {
        record::validate_key(key)?;
        let mut table = self.table.lock();
        if !self.overwrite && table.get(key).is_some() {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("key already present")
                .with_table(&self.name));
        }
        table
            .append(Record::Insert {
                key: key.to_vec(),
                value: value.clone(),
            })
            .map_err(|err| err.with_table(&self.name))?;
        self.position = Some(key.to_vec());
        Ok(())
    }

    fn search(&mut self, key: &[u8]) -> Result<Option<LookasideValue>, Error> {
        let table = self.table.lock();
        let found = table.get(key).cloned();
        if found.is_some() {
            self.position = Some(key.to_vec());
        }
        Ok(found)
    }

    fn remove(&mut self, key: &[u8]) -> Result<(), Error> {
        record::validate_key(key)?;
        let mut table = self.table.lock();
        if table.get(key).is_none() {
            if self.overwrite {
                return Ok(());
            }
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("key not present")
                .with_table(&self.name));
        }
        table
            .append(Record::Remove { key: key.to_vec() })
            .map_err(|err| err.with_table(&self.name))
    }

    fn next(&mut self) -> Result<Option<(Vec<u8>, LookasideValue)>, Error> {
        let table = self.table.lock();
        let entry = table
            .next_after(self.position.as_deref())
            .map(|(key, value)| (key.to_vec(), value.clone()));
        if let Some((key, _)) = &entry {
            self.position = Some(key.clone());
        }
        Ok(entry)
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.position = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CursorOptions, FileBackend, StorageBackend, TableCursor};
    use crate::core::error::ErrorKind;
    use crate::core::record::{LookasideValue, TableFormat};
    use crate::core::session::Session;
    use crate::core::table::{TableFile, TableFlags};

    fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn forced_drop_tolerates_missing_table() {
        let (_dir, backend) = backend();
        backend.drop_table("lookaside.las", true).expect("forced drop");
        let err = backend
            .drop_table("lookaside.las", false)
            .expect_err("plain drop of missing table");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn strict_cursor_rejects_duplicates_and_missing_removes() {
        let (_dir, backend) = backend();
        backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect("create");
        let session = Session::new("test");
        let mut cursor = backend
            .open_cursor(&session, "lookaside.las", CursorOptions { overwrite: false })
            .expect("cursor");

        let value = LookasideValue::new(3, 9, b"v".to_vec());
        cursor.insert(b"k", &value).expect("insert");
        let err = cursor.insert(b"k", &value).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        cursor.remove(b"k").expect("remove");
        let err = cursor.remove(b"k").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn default_cursor_overwrites() {
        let (_dir, backend) = backend();
        backend
            .create_table("plain", &TableFormat::lookaside())
            .expect("create");
        let session = Session::new("test");
        let mut cursor = backend
            .open_cursor(&session, "plain", CursorOptions::default())
            .expect("cursor");
        cursor.insert(b"k", &LookasideValue::new(1, 1, b"a".to_vec())).expect("insert");
        cursor.insert(b"k", &LookasideValue::new(2, 1, b"b".to_vec())).expect("overwrite");
        let found = cursor.search(b"k").expect("search").expect("present");
        assert_eq!(found.generation, 2);
        cursor.remove(b"missing").expect("lenient remove");
    }

    #[test]
    fn next_and_reset_track_position() {
        let (_dir, backend) = backend();
        backend
            .create_table("t", &TableFormat::lookaside())
            .expect("create");
        let session = Session::new("test");
        let mut cursor = backend
            .open_cursor(&session, "t", CursorOptions::default())
            .expect("cursor");
        for key in [&b"a"[..], b"b", b"c"] {
            cursor.insert(key, &LookasideValue::default()).expect("insert");
        }
        cursor.reset().expect("reset");
        assert_eq!(cursor.position(), None);
        let (first, _) = cursor.next().expect("next").expect("entry");
        assert_eq!(first, b"a".to_vec());
        let (second, _) = cursor.next().expect("next").expect("entry");
        assert_eq!(second, b"b".to_vec());
        cursor.reset().expect("reset");
        let (again, _) = cursor.next().expect("next").expect("entry");
        assert_eq!(again, b"a".to_vec());
    }

    #[test]
    fn create_drop_create_starts_empty() {
        let (dir, backend) = backend();
        let session = Session::new("test");
        backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect("create");
        let mut cursor = backend
            .open_cursor(&session, "lookaside.las", CursorOptions::default())
            .expect("cursor");
        cursor.insert(b"stale", &LookasideValue::default()).expect("insert");
        backend.close_session(session, Some(cursor)).expect("close");

        let err = backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect_err("exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        backend.drop_table("lookaside.las", true).expect("drop");
        assert!(!dir.path().join("lookaside.las").exists());
        backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect("recreate");
        let session = Session::new("test");
        let mut cursor = backend
            .open_cursor(&session, "lookaside.las", CursorOptions::default())
            .expect("cursor");
        assert!(cursor.search(b"stale").expect("search").is_none());
    }

    #[test]
    fn table_flags_persist_in_header() {
        let (dir, backend) = backend();
        backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect("create");
        backend
            .set_table_flags(
                "lookaside.las",
                TableFlags::LOOKASIDE | TableFlags::NO_CHECKPOINT | TableFlags::NO_LOGGING,
            )
            .expect("flags");
        let table = TableFile::open(dir.path().join("lookaside.las")).expect("open");
        assert!(table.header().flags.contains(TableFlags::LOOKASIDE));
        assert!(table.header().flags.contains(TableFlags::NO_CHECKPOINT));
    }

    #[test]
    fn path_like_names_are_rejected() {
        let (_dir, backend) = backend();
        let err = backend
            .create_table("../escape", &TableFormat::lookaside())
            .expect_err("bad name");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
