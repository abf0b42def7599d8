//! Compile-time layout constants and runtime-tunable options.

/// Fixed page size. Load-bearing for on-disk compatibility: never change.
pub const PAGE_SIZE: usize = 4096;

/// Size of the fixed file-header prefix that precedes page 0.
pub const FILE_HEADER_SIZE: usize = 64;

/// Size of the per-page header within a page's 4096 bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Usable data area per page.
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Size of one slot directory entry in a slotted page.
pub const SLOT_SIZE: usize = 6;

pub const FILE_MAGIC: u32 = 0x4D4F_4E4F; // "MONO"
pub const WAL_MAGIC: u32 = 0x5741_4C4D; // "WALM"
pub const MULTI_PAGE_CATALOG_MAGIC: u32 = 0x4D50_4354; // "MPCT"

pub const FORMAT_VERSION: u16 = 1;

/// B+Tree fan-out upper bound on `key_count` in any node.
pub const BTREE_ORDER: usize = 50;

/// Byte-driven node size ceiling: `max_page_data - 64`.
pub const BTREE_MAX_NODE_SIZE: usize = PAGE_DATA_SIZE - 64;

/// Split trigger threshold: 3/4 of `BTREE_MAX_NODE_SIZE`.
pub const BTREE_SPLIT_THRESHOLD: usize = (BTREE_MAX_NODE_SIZE * 3) / 4;

/// Maximum index key length: a page-data quarter.
pub const BTREE_MAX_KEY_LEN: usize = PAGE_DATA_SIZE / 4;

/// Maximum index value length.
pub const BTREE_MAX_VALUE_LEN: usize = 256;

/// Maximum document size.
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum batch insert size.
pub const MAX_BATCH_INSERT: usize = 100_000;

/// Default bounded page cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default WAL auto-truncate threshold.
pub const DEFAULT_WAL_AUTO_TRUNCATE_BYTES: u64 = 64 * 1024 * 1024;

/// Runtime-tunable knobs for opening a [`crate::pager::Pager`] /
/// [`crate::db::Database`].
#[derive(Debug, Clone, Copy)]
pub struct DbOptions {
    /// Maximum number of pages kept in the pager's read cache.
    pub cache_capacity: usize,
    /// Whether `Wal::checkpoint` truncates the body back to the header once
    /// it exceeds `wal_auto_truncate_bytes`.
    pub wal_auto_truncate: bool,
    /// Body-size threshold (in bytes) that triggers auto-truncation.
    pub wal_auto_truncate_bytes: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            wal_auto_truncate: true,
            wal_auto_truncate_bytes: DEFAULT_WAL_AUTO_TRUNCATE_BYTES,
        }
    }
}
