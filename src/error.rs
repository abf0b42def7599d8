use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds the storage core surfaces. Each variant maps to one row
/// of the error-handling design: `CorruptPage`/`CorruptWal` are fatal to the
/// operation in progress, `PageFull` is routine and handled by the caller,
/// `DuplicateKey`/`InvalidArgument` abort before or after rollback,
/// `NotFound` is often not an error at the API boundary, `Io` is surfaced
/// verbatim, and `Degraded` marks a handle that must not be reused.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt page {page_id}: {reason}")]
    CorruptPage { page_id: u32, reason: &'static str },

    #[error("corrupt wal at offset {offset}: {reason}")]
    CorruptWal { offset: u64, reason: &'static str },

    #[error("page {page_id} full: cannot fit {needed} bytes ({available} available)")]
    PageFull {
        page_id: u32,
        needed: usize,
        available: usize,
    },

    #[error("duplicate key for unique index {index}")]
    DuplicateKey { index: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Raised when a partial-rollback itself fails; per the recovery
    /// discipline the handle must not be used again before reopen.
    #[error("database handle degraded: {0}")]
    Degraded(String),
}

impl Error {
    pub fn corrupt_page(page_id: u32, reason: &'static str) -> Self {
        Error::CorruptPage { page_id, reason }
    }

    pub fn corrupt_wal(offset: u64, reason: &'static str) -> Self {
        Error::CorruptWal { offset, reason }
    }

    pub fn page_full(page_id: u32, needed: usize, available: usize) -> Self {
        Error::PageFull {
            page_id,
            needed,
            available,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn duplicate_key(index: impl Into<String>) -> Self {
        Error::DuplicateKey {
            index: index.into(),
        }
    }
}
