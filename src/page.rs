//! Fixed-size page: a 24-byte header plus a 4072-byte data area.

use crate::config::{PAGE_DATA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = 0,
    Meta = 1,
    Catalog = 2,
    Data = 3,
    Index = 4,
    Overflow = 5,
    FreeList = 6,
}

impl PageType {
    pub(crate) fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageType::Free,
            1 => PageType::Meta,
            2 => PageType::Catalog,
            3 => PageType::Data,
            4 => PageType::Index,
            5 => PageType::Overflow,
            6 => PageType::FreeList,
            other => {
                log::warn!("unrecognized page type byte {other}");
                return Err(Error::corrupt_page(0, "unknown page type"));
            }
        })
    }
}

/// An in-memory page: a 24-byte header plus the 4072-byte data area.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: u32,
    pub page_type: PageType,
    pub flags: u8,
    pub item_count: u16,
    pub free_space: u16,
    pub next_page_id: u32,
    pub prev_page_id: u32,
    pub data: Box<[u8; PAGE_DATA_SIZE]>,
}

impl Page {
    pub fn new(id: u32, page_type: PageType) -> Self {
        Self {
            id,
            page_type,
            flags: 0,
            item_count: 0,
            free_space: PAGE_DATA_SIZE as u16,
            next_page_id: 0,
            prev_page_id: 0,
            data: Box::new([0u8; PAGE_DATA_SIZE]),
        }
    }

    /// Serialize this page into an exact `PAGE_SIZE`-byte buffer, including
    /// the checksum computed over the data area.
    pub fn marshal(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4] = self.page_type as u8;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.item_count.to_le_bytes());
        buf[8..10].copy_from_slice(&self.free_space.to_le_bytes());
        buf[10..14].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[14..18].copy_from_slice(&self.prev_page_id.to_le_bytes());
        let checksum = checksum_of(&self.data[..]);
        buf[18..22].copy_from_slice(&checksum.to_le_bytes());
        // bytes 22..24 reserved, left zero.
        buf[PAGE_HEADER_SIZE..].copy_from_slice(&self.data[..]);
        buf
    }

    /// Parse a `PAGE_SIZE`-byte buffer into a page, verifying the checksum.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::corrupt_page(0, "page buffer has wrong length"));
        }
        let id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let page_type = PageType::from_u8(buf[4]).map_err(|_| {
            Error::corrupt_page(id, "unknown page type")
        })?;
        let flags = buf[5];
        let item_count = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let free_space = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let next_page_id = u32::from_le_bytes(buf[10..14].try_into().unwrap());
        let prev_page_id = u32::from_le_bytes(buf[14..18].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(buf[18..22].try_into().unwrap());

        let mut data = Box::new([0u8; PAGE_DATA_SIZE]);
        data.copy_from_slice(&buf[PAGE_HEADER_SIZE..]);

        let actual_checksum = checksum_of(&data[..]);
        if actual_checksum != stored_checksum {
            return Err(Error::corrupt_page(id, "checksum mismatch"));
        }

        Ok(Self {
            id,
            page_type,
            flags,
            item_count,
            free_space,
            next_page_id,
            prev_page_id,
            data,
        })
    }
}

/// XOR of 32-bit little-endian words over the data area, tail zero-padded.
pub fn checksum_of(data: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        acc ^= u32::from_le_bytes(chunk.try_into().unwrap());
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut tail = [0u8; 4];
        tail[..rem.len()].copy_from_slice(rem);
        acc ^= u32::from_le_bytes(tail);
    }
    acc
}
