//! Write-ahead log: a 32-byte file header followed by 8-byte-aligned
//! records, each with a 20-byte header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::{Error, Result};

const WAL_HEADER_SIZE: u64 = 32;
const RECORD_HEADER_SIZE: usize = 20;
const CRC_COVERED_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    PageWrite = 1,
    AllocPage = 2,
    FreePage = 3,
    Commit = 4,
    Checkpoint = 5,
    MetaUpdate = 6,
}

impl WalRecordType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => WalRecordType::PageWrite,
            2 => WalRecordType::AllocPage,
            3 => WalRecordType::FreePage,
            4 => WalRecordType::Commit,
            5 => WalRecordType::Checkpoint,
            6 => WalRecordType::MetaUpdate,
            _ => return None,
        })
    }
}

/// `MetaUpdate` subtype, carried as the leading byte of the record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaUpdateKind {
    FreeListHead = 1,
    PageCount = 2,
    CatalogPageId = 3,
}

impl MetaUpdateKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MetaUpdateKind::FreeListHead,
            2 => MetaUpdateKind::PageCount,
            3 => MetaUpdateKind::CatalogPageId,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub lsn: u64,
    pub record_type: WalRecordType,
    pub flags: u8,
    pub page_id: u32,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// The subtype byte leading a meta-update record's payload.
    pub fn meta_kind(&self) -> Option<MetaUpdateKind> {
        if self.record_type != WalRecordType::MetaUpdate || self.payload.is_empty() {
            return None;
        }
        MetaUpdateKind::from_u8(self.payload[0])
    }

    /// The `(old, new)` values following the subtype byte in a meta-update
    /// record's payload.
    pub fn meta_values(&self) -> Option<(u32, u32)> {
        if self.record_type != WalRecordType::MetaUpdate || self.payload.len() < 9 {
            return None;
        }
        let old = u32::from_le_bytes(self.payload[1..5].try_into().unwrap());
        let new = u32::from_le_bytes(self.payload[5..9].try_into().unwrap());
        Some((old, new))
    }

    /// The new page type byte carried by an alloc-page record's payload.
    pub fn alloc_page_type(&self) -> Option<u8> {
        if self.record_type != WalRecordType::AllocPage {
            return None;
        }
        self.payload.first().copied()
    }

    fn encode(&self) -> Vec<u8> {
        let data_length = u16::try_from(self.payload.len()).expect("wal payload fits u16");
        let mut prefix = Vec::with_capacity(CRC_COVERED_PREFIX + self.payload.len());
        prefix.extend_from_slice(&self.lsn.to_le_bytes());
        prefix.push(self.record_type as u8);
        prefix.push(self.flags);
        prefix.extend_from_slice(&data_length.to_le_bytes());
        prefix.extend_from_slice(&self.page_id.to_le_bytes());
        prefix.extend_from_slice(&self.payload);

        let crc = crc32(&prefix);
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&prefix[..CRC_COVERED_PREFIX]);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&self.payload);

        let padded_len = align_up(out.len());
        out.resize(padded_len, 0);
        out
    }
}

fn align_up(n: usize) -> usize {
    (n + 7) & !7
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Write-ahead log file (`<db>.wal`).
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    checkpoint_lsn: u64,
    next_lsn: u64,
}

impl Wal {
    /// Open (creating if absent) the WAL file, writing a fresh header for a
    /// new file or validating the existing one, then scanning the body to
    /// recover `next_lsn` from the last structurally valid record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let checkpoint_lsn = if len == 0 {
            write_header(&mut file, 0, WAL_HEADER_SIZE)?;
            file.sync_all()?;
            0
        } else {
            read_and_validate_header(&mut file)?
        };

        let mut wal = Self {
            path,
            file,
            checkpoint_lsn,
            next_lsn: 1,
        };
        let records = wal.read_records()?;
        if let Some(last) = records.last() {
            wal.next_lsn = last.lsn + 1;
        }
        Ok(wal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    /// Read every structurally valid record from the body, in file order.
    /// Stops (without error) at the first truncated or CRC-mismatched
    /// record: a torn tail is an expected consequence of a crash mid-write,
    /// not a corruption to report.
    pub fn read_records(&mut self) -> Result<Vec<WalRecord>> {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE))?;
        let mut records = Vec::new();
        loop {
            match read_one_record(&mut self.file)? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    /// Records with LSN greater than the checkpoint LSN, i.e. the ones that
    /// still need replaying after a reopen.
    pub fn records_since_checkpoint(&mut self) -> Result<Vec<WalRecord>> {
        let checkpoint_lsn = self.checkpoint_lsn;
        Ok(self
            .read_records()?
            .into_iter()
            .filter(|r| r.lsn > checkpoint_lsn)
            .collect())
    }

    fn append(&mut self, record_type: WalRecordType, flags: u8, page_id: u32, payload: Vec<u8>) -> Result<u64> {
        let lsn = self.next_lsn;
        let record = WalRecord {
            lsn,
            record_type,
            flags,
            page_id,
            payload,
        };
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record.encode())?;
        self.next_lsn += 1;
        Ok(lsn)
    }

    pub fn append_page_write(&mut self, page_id: u32, page_bytes: &[u8]) -> Result<u64> {
        self.append(WalRecordType::PageWrite, 0, page_id, page_bytes.to_vec())
    }

    /// `page_type` is the one-byte `PageType` discriminant the allocated
    /// page was created with; recovery needs it to reinitialize the page
    /// region if no later page-write record overwrites it.
    pub fn append_alloc_page(&mut self, page_id: u32, page_type: u8) -> Result<u64> {
        self.append(WalRecordType::AllocPage, 0, page_id, vec![page_type])
    }

    pub fn append_free_page(&mut self, page_id: u32) -> Result<u64> {
        self.append(WalRecordType::FreePage, 0, page_id, Vec::new())
    }

    pub fn append_commit(&mut self) -> Result<u64> {
        self.append(WalRecordType::Commit, 0, 0, Vec::new())
    }

    pub fn append_meta_update(&mut self, kind: MetaUpdateKind, old: u32, new: u32) -> Result<u64> {
        let mut payload = Vec::with_capacity(9);
        payload.push(kind as u8);
        payload.extend_from_slice(&old.to_le_bytes());
        payload.extend_from_slice(&new.to_le_bytes());
        self.append(WalRecordType::MetaUpdate, 0, 0, payload)
    }

    /// Append a checkpoint record and update the file header to mark
    /// everything up to `lsn` as durable and no longer needed for replay.
    /// When `auto_truncate` is set and the body has grown past
    /// `truncate_threshold_bytes`, the body is discarded entirely (the
    /// checkpoint already guarantees the pager's on-disk state reflects
    /// everything up to `lsn`).
    pub fn checkpoint(&mut self, lsn: u64, auto_truncate: bool, truncate_threshold_bytes: u64) -> Result<()> {
        self.append(WalRecordType::Checkpoint, 0, 0, Vec::new())?;
        self.checkpoint_lsn = lsn;
        self.file.sync_data()?;

        let body_len = self.file.metadata()?.len().saturating_sub(WAL_HEADER_SIZE);
        if auto_truncate && body_len > truncate_threshold_bytes {
            self.file.set_len(WAL_HEADER_SIZE)?;
        }

        let file_size = self.file.metadata()?.len();
        write_header(&mut self.file, self.checkpoint_lsn, file_size)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_header(file: &mut File, checkpoint_lsn: u64, file_size: u64) -> Result<()> {
    let mut buf = [0u8; WAL_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&crate::config::WAL_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&crate::config::FORMAT_VERSION.to_le_bytes());
    // bytes 6..8 reserved.
    buf[8..16].copy_from_slice(&checkpoint_lsn.to_le_bytes());
    buf[16..24].copy_from_slice(&file_size.to_le_bytes());
    let crc = crc32(&buf[0..24]);
    buf[24..28].copy_from_slice(&crc.to_le_bytes());
    // bytes 28..32 reserved.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_and_validate_header(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; WAL_HEADER_SIZE as usize];
    file.read_exact(&mut buf)?;

    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != crate::config::WAL_MAGIC {
        return Err(Error::corrupt_wal(0, "bad wal magic"));
    }
    let stored_crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());
    let actual_crc = crc32(&buf[0..24]);
    if stored_crc != actual_crc {
        return Err(Error::corrupt_wal(24, "wal header checksum mismatch"));
    }
    let checkpoint_lsn = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    Ok(checkpoint_lsn)
}

fn read_one_record(file: &mut File) -> Result<Option<WalRecord>> {
    let record_start = file.stream_position()?;

    let mut header = [0u8; RECORD_HEADER_SIZE];
    if let Err(e) = file.read_exact(&mut header) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(Error::Io(e));
    }

    let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let Some(record_type) = WalRecordType::from_u8(header[8]) else {
        return Ok(None);
    };
    let flags = header[9];
    let data_length = u16::from_le_bytes(header[10..12].try_into().unwrap()) as usize;
    let page_id = u32::from_le_bytes(header[12..16].try_into().unwrap());
    let stored_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());

    let mut payload = vec![0u8; data_length];
    if let Err(e) = file.read_exact(&mut payload) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            // Torn tail: rewind so a subsequent read starts clean, then stop.
            file.seek(SeekFrom::Start(record_start))?;
            return Ok(None);
        }
        return Err(Error::Io(e));
    }

    let mut prefix = header[0..CRC_COVERED_PREFIX].to_vec();
    prefix.extend_from_slice(&payload);
    if crc32(&prefix) != stored_crc {
        file.seek(SeekFrom::Start(record_start))?;
        return Ok(None);
    }

    let padded_len = align_up(RECORD_HEADER_SIZE + data_length) as i64;
    let consumed = (RECORD_HEADER_SIZE + data_length) as i64;
    if padded_len > consumed {
        file.seek(SeekFrom::Current(padded_len - consumed))?;
    }

    Ok(Some(WalRecord {
        lsn,
        record_type,
        flags,
        page_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_round_trip_and_lsns_start_at_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let lsn1;
        let lsn2;
        {
            let mut wal = Wal::open(&path).unwrap();
            lsn1 = wal.append_alloc_page(5, 3).unwrap();
            lsn2 = wal.append_page_write(5, &[0xAB; 10]).unwrap();
            wal.append_commit().unwrap();
            wal.sync().unwrap();
        }
        assert_eq!(lsn1, 1);
        assert_eq!(lsn2, 2);

        let mut wal = Wal::open(&path).unwrap();
        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_type, WalRecordType::AllocPage);
        assert_eq!(records[1].record_type, WalRecordType::PageWrite);
        assert_eq!(records[1].payload, vec![0xAB; 10]);
        assert_eq!(records[2].record_type, WalRecordType::Commit);
    }

    #[test]
    fn checkpoint_filters_replay_to_records_after_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let mut wal = Wal::open(&path).unwrap();
        wal.append_alloc_page(1, 3).unwrap();
        let commit_lsn = wal.append_commit().unwrap();
        wal.checkpoint(commit_lsn, false, 0).unwrap();
        wal.append_alloc_page(2, 3).unwrap();

        let pending = wal.records_since_checkpoint().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].page_id, 2);
    }

    #[test]
    fn replay_is_idempotent_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_alloc_page(3, 3).unwrap();
            wal.append_commit().unwrap();
            wal.sync().unwrap();
        }

        let first: Vec<_> = Wal::open(&path)
            .unwrap()
            .read_records()
            .unwrap()
            .into_iter()
            .map(|r| r.lsn)
            .collect();
        let second: Vec<_> = Wal::open(&path)
            .unwrap()
            .read_records()
            .unwrap()
            .into_iter()
            .map(|r| r.lsn)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn torn_trailing_record_is_dropped_not_errored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_alloc_page(9, 3).unwrap();
            wal.append_commit().unwrap();
            wal.sync().unwrap();
        }

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        let mut wal = Wal::open(&path).unwrap();
        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(Wal::open(&path).is_err());
    }
}
