//! Purpose: Define the lookaside table's key/value contract and its record framing.
//! Exports: `TableFormat`, `LookasideValue`, `RecordOp`, `RecordHeader`, `encode_record`, `decode_record`.
//! Role: Stable wire contract shared by the store, the file backend, and external readers.
//! Invariants: Key is opaque bytes; value is (generation: u64, id: u32, payload: bytes).
//! Invariants: Record frames are 8-byte aligned and carry a length xor for torn-write detection.
use crate::core::error::{Error, ErrorKind};

/// Key format string for the lookaside table: one opaque byte string.
pub const KEY_FORMAT: &str = "u";
/// Value format string: generation counter, id, opaque payload.
pub const VALUE_FORMAT: &str = "QIu";

pub const RECORD_MAGIC: [u8; 4] = *b"LREC";
pub const RECORD_HEADER_LEN: usize = 32;
pub const MAX_KEY_LEN: usize = 64 * 1024;
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableFormat {
    pub key_format: String,
    pub value_format: String,
}

impl TableFormat {
    pub fn lookaside() -> Self {
        Self {
            key_format: KEY_FORMAT.to_string(),
            value_format: VALUE_FORMAT.to_string(),
        }
    }
}

/// One historical version parked in the lookaside table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LookasideValue {
    pub generation: u64,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl LookasideValue {
    pub fn new(generation: u64, id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            generation,
            id,
            payload: payload.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordOp {
    Insert = 1,
    Remove = 2,
}

impl RecordOp {
    fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(RecordOp::Insert),
            2 => Ok(RecordOp::Remove),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid record op")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub op: RecordOp,
    pub key_len: u32,
    pub payload_len: u32,
    pub generation: u64,
    pub id: u32,
    pub len_xor: u32,
}

impl RecordHeader {
    pub fn new(op: RecordOp, key_len: u32, payload_len: u32, generation: u64, id: u32) -> Self {
        Self {
            op,
            key_len,
            payload_len,
            generation,
            id,
            len_xor: key_len ^ payload_len ^ 0xFFFF_FFFF,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&RECORD_MAGIC);
        buf[4] = self.op as u8;
        write_u32(&mut buf, 8, self.key_len);
        write_u32(&mut buf, 12, self.payload_len);
        write_u64(&mut buf, 16, self.generation);
        write_u32(&mut buf, 24, self.id);
        write_u32(&mut buf, 28, self.len_xor);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record header too small"));
        }
        if buf[0..4] != RECORD_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad record magic"));
        }
        Ok(Self {
            op: RecordOp::from_u8(buf[4])?,
            key_len: read_u32(buf, 8),
            payload_len: read_u32(buf, 12),
            generation: read_u64(buf, 16),
            id: read_u32(buf, 24),
            len_xor: read_u32(buf, 28),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.key_len ^ self.payload_len ^ self.len_xor != 0xFFFF_FFFF {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record length xor mismatch"));
        }
        if self.key_len as usize > MAX_KEY_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("key length exceeds max"));
        }
        if self.payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload length exceeds max"));
        }
        Ok(())
    }

    pub fn total_len(&self) -> usize {
        record_total_len(self.key_len as usize, self.payload_len as usize)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Record {
    Insert { key: Vec<u8>, value: LookasideValue },
    Remove { key: Vec<u8> },
}

pub fn align8(value: usize) -> usize {
    (value + 7) & !7
}

pub fn record_total_len(key_len: usize, payload_len: usize) -> usize {
    align8(RECORD_HEADER_LEN + key_len + payload_len)
}

pub fn validate_key(key: &[u8]) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("lookaside key is empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::new(ErrorKind::Usage).with_message("lookaside key too large"));
    }
    Ok(())
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>, Error> {
    let (header, key, payload): (RecordHeader, &[u8], &[u8]) = match record {
        Record::Insert { key, value } => {
            validate_key(key)?;
            if value.payload.len() > MAX_PAYLOAD_LEN {
                return Err(Error::new(ErrorKind::Usage).with_message("payload too large"));
            }
            let header = RecordHeader::new(
                RecordOp::Insert,
                key.len() as u32,
                value.payload.len() as u32,
                value.generation,
                value.id,
            );
            (header, key.as_slice(), value.payload.as_slice())
        }
        Record::Remove { key } => {
            validate_key(key)?;
            let header = RecordHeader::new(RecordOp::Remove, key.len() as u32, 0, 0, 0);
            (header, key.as_slice(), &[][..])
        }
    };

    let mut buf = vec![0u8; header.total_len()];
    buf[..RECORD_HEADER_LEN].copy_from_slice(&header.encode());
    let key_end = RECORD_HEADER_LEN + key.len();
    buf[RECORD_HEADER_LEN..key_end].copy_from_slice(key);
    buf[key_end..key_end + payload.len()].copy_from_slice(payload);
    Ok(buf)
}

/// Decodes the record at `offset`; `Ok(None)` means `offset` is the clean end of `buf`.
pub fn decode_record(buf: &[u8], offset: usize) -> Result<Option<(Record, usize)>, Error> {
    if offset == buf.len() {
        return Ok(None);
    }
    let corrupt = |message: &str| {
        Error::new(ErrorKind::Corrupt)
            .with_message(message.to_string())
            .with_offset(offset as u64)
    };
    if buf.len() - offset < RECORD_HEADER_LEN {
        return Err(corrupt("truncated record header"));
    }
    let header = RecordHeader::decode(&buf[offset..offset + RECORD_HEADER_LEN])
        .and_then(|header| header.validate().map(|()| header))
        .map_err(|err| err.with_offset(offset as u64))?;
    let total = header.total_len();
    if buf.len() - offset < total {
        return Err(corrupt("truncated record body"));
    }

    let key_start = offset + RECORD_HEADER_LEN;
    let key_end = key_start + header.key_len as usize;
    let key = buf[key_start..key_end].to_vec();
    let record = match header.op {
        RecordOp::Insert => {
            let payload_end = key_end + header.payload_len as usize;
            Record::Insert {
                key,
                value: LookasideValue {
                    generation: header.generation,
                    id: header.id,
                    payload: buf[key_end..payload_end].to_vec(),
                },
            }
        }
        RecordOp::Remove => Record::Remove { key },
    };
    Ok(Some((record, offset + total)))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
