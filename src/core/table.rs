// Table file creation/opening with header validation, record replay, and append locking.
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{self, LookasideValue, Record, TableFormat};

const MAGIC: [u8; 4] = *b"LAS1";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
pub const HEADER_SIZE: usize = 4096;
const FORMAT_FIELD_LEN: usize = 16;

/// Table-level attributes persisted in the header.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq, Hash)]
pub struct TableFlags(u64);

impl TableFlags {
    pub const NONE: Self = Self(0);
    pub const LOOKASIDE: Self = Self(0x01);
    pub const NO_CHECKPOINT: Self = Self(0x02);
    pub const NO_LOGGING: Self = Self(0x04);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TableFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableHeader {
    pub format: TableFormat,
    pub flags: TableFlags,
}

impl TableHeader {
    fn encode(&self) -> Result<[u8; HEADER_SIZE], Error> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;
        write_format(&mut buf, 16, &self.format.key_format)?;
        write_format(&mut buf, 32, &self.format.value_format)?;
        buf[48..56].copy_from_slice(&self.flags.bits().to_le_bytes());
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&buf[4..8]);
        if u32::from_le_bytes(version) != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }
        let mut flags = [0u8; 8];
        flags.copy_from_slice(&buf[48..56]);
        Ok(Self {
            format: TableFormat {
                key_format: read_format(buf, 16)?,
                value_format: read_format(buf, 32)?,
            },
            flags: TableFlags::from_bits(u64::from_le_bytes(flags)),
        })
    }
}

fn write_format(buf: &mut [u8], offset: usize, value: &str) -> Result<(), Error> {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > FORMAT_FIELD_LEN || bytes.contains(&0) {
        return Err(Error::new(ErrorKind::Usage).with_message("invalid table format string"));
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_format(buf: &[u8], offset: usize) -> Result<String, Error> {
    let field = &buf[offset..offset + FORMAT_FIELD_LEN];
    let len = field.iter().position(|byte| *byte == 0).unwrap_or(FORMAT_FIELD_LEN);
    String::from_utf8(field[..len].to_vec())
        .map_err(|err| Error::new(ErrorKind::Corrupt).with_message("bad format string").with_source(err))
}

/// One open table: the file plus an in-memory index rebuilt from its record log.
pub struct TableFile {
    path: PathBuf,
    file: File,
    header: TableHeader,
    index: BTreeMap<Vec<u8>, LookasideValue>,
    end_off: u64,
    appended: u64,
}

impl TableFile {
    pub fn create(path: impl AsRef<Path>, format: &TableFormat) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let header = TableHeader {
            format: format.clone(),
            flags: TableFlags::NONE,
        };
        let encoded = header.encode()?;
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        write_at(&file, 0, &encoded, &path)?;

        Ok(Self {
            path,
            file,
            header,
            index: BTreeMap::new(),
            end_off: HEADER_SIZE as u64,
            appended: 0,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut bytes))
            .map_err(|err| io_error(&path, err))?;
        let header = TableHeader::decode(&bytes).map_err(|err| err.with_path(&path))?;

        let mut index = BTreeMap::new();
        let log = &bytes[HEADER_SIZE..];
        let mut offset = 0;
        while let Some((record, next)) = record::decode_record(log, offset)
            .map_err(|err| err.with_path(&path))?
        {
            apply(&mut index, record);
            offset = next;
        }

        Ok(Self {
            path,
            file,
            header,
            index,
            end_off: (HEADER_SIZE + offset) as u64,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records appended through this handle since it was opened.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn get(&self, key: &[u8]) -> Option<&LookasideValue> {
        self.index.get(key)
    }

    /// First entry strictly after `after`, or the first entry when `after` is `None`.
    pub fn next_after(&self, after: Option<&[u8]>) -> Option<(&[u8], &LookasideValue)> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.index
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(key, value)| (key.as_slice(), value))
    }

    pub fn set_flags(&mut self, flags: TableFlags) -> Result<(), Error> {
        let header = TableHeader {
            format: self.header.format.clone(),
            flags,
        };
        let encoded = header.encode()?;
        {
            let _lock = self.append_lock()?;
            write_at(&self.file, 0, &encoded, &self.path)?;
        }
        self.header = header;
        Ok(())
    }

    pub fn append(&mut self, record: Record) -> Result<(), Error> {
        let encoded = record::encode_record(&record)?;
        {
            let _lock = self.append_lock()?;
            write_at(&self.file, self.end_off, &encoded, &self.path)?;
        }
        self.end_off += encoded.len() as u64;
        self.appended += 1;
        apply(&mut self.index, record);
        Ok(())
    }

    /// Flushes file contents to stable storage unless the table opted out of checkpoints.
    pub fn sync(&self) -> Result<(), Error> {
        if self.header.flags.contains(TableFlags::NO_CHECKPOINT) {
            return Ok(());
        }
        self.file.sync_data().map_err(|err| io_error(&self.path, err))
    }

    fn append_lock(&self) -> Result<AppendLock<'_>, Error> {
        self.file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&self.path)
                .with_source(err)
        })?;
        Ok(AppendLock { file: &self.file })
    }
}

fn apply(index: &mut BTreeMap<Vec<u8>, LookasideValue>, record: Record) {
    match record {
        Record::Insert { key, value } => {
            index.insert(key, value);
        }
        Record::Remove { key } => {
            index.remove(&key);
        }
    }
}

pub struct AppendLock<'a> {
    file: &'a File,
}

impl<'a> Drop for AppendLock<'a> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

pub(crate) fn io_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

fn write_at(mut file: &File, offset: u64, buf: &[u8], path: &Path) -> Result<(), Error> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| io_error(path, err))?;
    file.write_all(buf).map_err(|err| io_error(path, err))?;
    file.flush().map_err(|err| io_error(path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{TableFile, TableFlags, HEADER_SIZE};
    use crate::core::error::ErrorKind;
    use crate::core::record::{LookasideValue, Record, TableFormat};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn create_append_and_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lookaside.las");
        let mut table = TableFile::create(&path, &TableFormat::lookaside()).expect("create");
        table
            .append(Record::Insert {
                key: b"a".to_vec(),
                value: LookasideValue::new(1, 10, b"one".to_vec()),
            })
            .expect("insert a");
        table
            .append(Record::Insert {
                key: b"b".to_vec(),
                value: LookasideValue::new(2, 20, b"two".to_vec()),
            })
            .expect("insert b");
        table
            .append(Record::Remove { key: b"a".to_vec() })
            .expect("remove a");
        table
            .set_flags(TableFlags::LOOKASIDE | TableFlags::NO_LOGGING)
            .expect("flags");
        drop(table);

        let reopened = TableFile::open(&path).expect("open");
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(b"a").is_none());
        assert_eq!(reopened.get(b"b").map(|value| value.id), Some(20));
        assert_eq!(reopened.header().format, TableFormat::lookaside());
        assert!(reopened.header().flags.contains(TableFlags::NO_LOGGING));
        assert!(!reopened.header().flags.contains(TableFlags::NO_CHECKPOINT));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lookaside.las");
        TableFile::create(&path, &TableFormat::lookaside()).expect("create");
        let err = TableFile::create(&path, &TableFormat::lookaside())
            .err()
            .expect("second create fails");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lookaside.las");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .expect("create");
        file.set_len(HEADER_SIZE as u64).expect("len");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.write_all(b"NOPE").expect("write");
        file.flush().expect("flush");

        match TableFile::open(&path) {
            Ok(_) => panic!("expected corrupt header error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Corrupt),
        }
    }

    #[test]
    fn next_after_walks_keys_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lookaside.las");
        let mut table = TableFile::create(&path, &TableFormat::lookaside()).expect("create");
        for key in [b"c", b"a", b"b"] {
            table
                .append(Record::Insert {
                    key: key.to_vec(),
                    value: LookasideValue::default(),
                })
                .expect("insert");
        }
        let (first, _) = table.next_after(None).expect("first");
        assert_eq!(first, b"a");
        let (second, _) = table.next_after(Some(&b"a"[..])).expect("second");
        assert_eq!(second, b"b");
        assert!(table.next_after(Some(&b"c"[..])).is_none());
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Busy);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
