//! Error types for the shared cache loader.
//!
//! Format parsers surface failures to the nearest loader operation, which
//! logs and returns an empty / `false` result; no error crosses the
//! controller API as a panic except a virtual-memory mapping collision,
//! which indicates malformed input that would corrupt address lookups.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for shared cache loading operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing file '{path}'")]
    MissingFile { path: PathBuf },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mapping Errors ====================
    #[error("read of {len} bytes at offset {offset:#x} is outside the mapped range (len {mapped:#x})")]
    MappingRead {
        offset: u64,
        len: usize,
        mapped: u64,
    },

    #[error("address {addr:#x} is not mapped")]
    Unmapped { addr: u64 },

    #[error(
        "mapping at {addr:#x} (size {size:#x}) is not aligned to the {page_size:#x} byte page size"
    )]
    MappingAlignment {
        addr: u64,
        size: u64,
        page_size: u64,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld' prefix, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("parse error at offset {offset:#x}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: u64 },

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: u64 },

    // ==================== State Errors ====================
    #[error("persisted metadata version {found} does not match expected {expected}")]
    StateVersionMismatch { found: u32, expected: u32 },

    #[error("failed to decode persisted metadata: {0}")]
    StateDecode(#[from] serde_json::Error),
}

/// A specialized Result type for shared cache operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        Error::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true if this error is a bounds failure on a mapped read.
    ///
    /// Chain walkers treat these as soft: the current chain is abandoned and
    /// subsequent chains continue.
    #[inline]
    pub fn is_mapping_read(&self) -> bool {
        matches!(self, Error::MappingRead { .. } | Error::Unmapped { .. })
    }
}
