//! Per-instance commit journal.
//!
//! `journal.dat` exists only while a commit is in flight. It holds one
//! transaction as a sequence of records:
//!
//! ```text
//! Begin { txid, global? }  Write/Erase ...  Commit { txid, entries }
//! ```
//!
//! Each record is framed like this:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | len (4) | payload (len) | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it. A journal is complete only if it
//! decodes cleanly from `Begin` through a `Commit` whose txid and entry count
//! match. Anything else was torn before the commit point and is discarded.

use crate::error::{CoreError, CoreResult};
use crate::hash::compute_crc32;
use crate::key::{SectorHeader, SectorKey, SECTOR_KEY_HEADER};
use crate::types::TransactionId;
use lld_storage::Volume;

/// File name of the journal inside an instance directory.
pub const JOURNAL_FILE: &str = "journal.dat";

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"LLDJ";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// One buffered mutation of a transaction.
///
/// `old` is the committed entry the transaction started from, kept so a
/// failed apply can be undone. `new` is `None` for an erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalOp {
    /// Key being changed.
    pub key: Vec<u8>,
    /// Committed entry before the transaction.
    pub old: Option<SectorKey>,
    /// Entry after commit, or `None` for an erase.
    pub new: Option<SectorKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Begin = 1,
    Write = 2,
    Erase = 3,
    Commit = 4,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Write),
            3 => Some(Self::Erase),
            4 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// A decoded journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    Begin {
        txid: TransactionId,
        global: Option<u64>,
    },
    Write {
        old: Option<SectorKey>,
        new: SectorKey,
    },
    Erase {
        key: Vec<u8>,
        old: Option<SectorKey>,
    },
    Commit {
        txid: TransactionId,
        entries: u32,
    },
}

impl Record {
    fn record_type(&self) -> RecordType {
        match self {
            Self::Begin { .. } => RecordType::Begin,
            Self::Write { .. } => RecordType::Write,
            Self::Erase { .. } => RecordType::Erase,
            Self::Commit { .. } => RecordType::Commit,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Begin { txid, global } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                match global {
                    Some(id) => {
                        buf.push(1);
                        buf.extend_from_slice(&id.to_le_bytes());
                    }
                    None => buf.push(0),
                }
            }
            Self::Write { old, new } => {
                put_optional_key(&mut buf, old.as_ref());
                buf.extend_from_slice(&new.encode());
            }
            Self::Erase { key, old } => {
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
                put_optional_key(&mut buf, old.as_ref());
            }
            Self::Commit { txid, entries } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                buf.extend_from_slice(&entries.to_le_bytes());
            }
        }
        buf
    }

    fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(self.record_type() as u8);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    fn decode_payload(record_type: RecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::new(payload);
        let record = match record_type {
            RecordType::Begin => {
                let txid = TransactionId::new(reader.u64()?);
                let global = match reader.u8()? {
                    0 => None,
                    _ => Some(reader.u64()?),
                };
                Self::Begin { txid, global }
            }
            RecordType::Write => {
                let old = reader.optional_key()?;
                let new = reader.key()?;
                Self::Write { old, new }
            }
            RecordType::Erase => {
                let len = reader.u32()? as usize;
                let key = reader.bytes(len)?.to_vec();
                let old = reader.optional_key()?;
                Self::Erase { key, old }
            }
            RecordType::Commit => Self::Commit {
                txid: TransactionId::new(reader.u64()?),
                entries: reader.u32()?,
            },
        };
        reader.finish(record_type)?;
        Ok(record)
    }
}

fn put_optional_key(buf: &mut Vec<u8>, key: Option<&SectorKey>) {
    match key {
        Some(key) => {
            buf.push(1);
            buf.extend_from_slice(&key.encode());
        }
        None => buf.push(0),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CoreError::invalid_format("unexpected end of journal payload"))?;
        let data = self.data;
        self.cursor = end;
        Ok(&data[end - len..end])
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(out))
    }

    fn key(&mut self) -> CoreResult<SectorKey> {
        let data = self.data;
        let header = SectorHeader::decode(&data[self.cursor..])?;
        let len = SECTOR_KEY_HEADER + header.key_len as usize;
        SectorKey::decode(self.bytes(len)?)
    }

    fn optional_key(&mut self) -> CoreResult<Option<SectorKey>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.key()?)),
        }
    }

    fn finish(&self, record_type: RecordType) -> CoreResult<()> {
        if self.cursor != self.data.len() {
            return Err(CoreError::invalid_format(format!(
                "trailing bytes in {record_type:?} record: expected {}, got {}",
                self.cursor,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Decodes records from the front of `data`, stopping at the first record
/// that is truncated or fails its checksum.
fn decode_records(data: &[u8]) -> (Vec<Record>, bool) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_SIZE {
            return (records, false);
        }
        if rest[0..4] != JOURNAL_MAGIC
            || u16::from_le_bytes([rest[4], rest[5]]) != JOURNAL_VERSION
        {
            return (records, false);
        }
        let Some(record_type) = RecordType::from_byte(rest[6]) else {
            return (records, false);
        };
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            return (records, false);
        }
        let crc_at = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            rest[crc_at],
            rest[crc_at + 1],
            rest[crc_at + 2],
            rest[crc_at + 3],
        ]);
        if stored != compute_crc32(&rest[..crc_at]) {
            return (records, false);
        }
        match Record::decode_payload(record_type, &rest[HEADER_SIZE..crc_at]) {
            Ok(record) => records.push(record),
            Err(_) => return (records, false),
        }
        offset += total;
    }
    (records, true)
}

/// A journal that reached its commit marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedJournal {
    /// Instance-local transaction id.
    pub txid: TransactionId,
    /// Global transaction id, if the commit was coordinated.
    pub global: Option<u64>,
    /// Mutations in commit order.
    pub ops: Vec<JournalOp>,
}

/// What was found in an instance's journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalState {
    /// No journal file.
    Absent,
    /// A journal torn before its commit marker.
    Incomplete {
        /// Records that decoded before the tear.
        records: usize,
    },
    /// A journal whose commit marker is durable.
    Complete(CommittedJournal),
}

/// Encodes a full journal for one transaction.
#[must_use]
pub fn encode(txid: TransactionId, global: Option<u64>, ops: &[JournalOp]) -> Vec<u8> {
    let mut data = Record::Begin { txid, global }.encode();
    for op in ops {
        let record = match &op.new {
            Some(new) => Record::Write {
                old: op.old.clone(),
                new: new.clone(),
            },
            None => Record::Erase {
                key: op.key.clone(),
                old: op.old.clone(),
            },
        };
        data.extend_from_slice(&record.encode());
    }
    data.extend_from_slice(
        &Record::Commit {
            txid,
            entries: ops.len() as u32,
        }
        .encode(),
    );
    data
}

/// Classifies raw journal bytes.
#[must_use]
pub fn decode(data: &[u8]) -> JournalState {
    let (records, clean) = decode_records(data);
    let count = records.len();
    let incomplete = JournalState::Incomplete { records: count };
    if !clean {
        return incomplete;
    }

    let mut iter = records.into_iter();
    let Some(Record::Begin { txid, global }) = iter.next() else {
        return incomplete;
    };
    let mut ops = Vec::new();
    for record in iter {
        match record {
            Record::Write { old, new } => ops.push(JournalOp {
                key: new.key.clone(),
                old,
                new: Some(new),
            }),
            Record::Erase { key, old } => ops.push(JournalOp { key, old, new: None }),
            Record::Commit {
                txid: commit_txid,
                entries,
            } if commit_txid == txid && entries as usize == ops.len() && ops.len() + 2 == count => {
                return JournalState::Complete(CommittedJournal { txid, global, ops });
            }
            _ => return incomplete,
        }
    }
    incomplete
}

/// Writes the journal and makes it durable.
///
/// # Errors
///
/// Returns a storage error if the write or sync fails.
pub fn write(
    volume: &dyn Volume,
    txid: TransactionId,
    global: Option<u64>,
    ops: &[JournalOp],
) -> CoreResult<()> {
    let data = encode(txid, global, ops);
    let mut backend = volume.open(JOURNAL_FILE)?;
    backend.truncate(0)?;
    backend.append(&data)?;
    backend.sync()?;
    volume.sync()?;
    Ok(())
}

/// Reads and classifies the journal of an instance.
///
/// # Errors
///
/// Returns a storage error if the file cannot be read.
pub fn read(volume: &dyn Volume) -> CoreResult<JournalState> {
    match volume.read_file(JOURNAL_FILE)? {
        None => Ok(JournalState::Absent),
        Some(data) => Ok(decode(&data)),
    }
}

/// Deletes the journal.
///
/// # Errors
///
/// Returns a storage error if the removal fails.
pub fn remove(volume: &dyn Volume) -> CoreResult<()> {
    volume.remove(JOURNAL_FILE)?;
    Ok(())
}
