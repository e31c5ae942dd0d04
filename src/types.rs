//! Core type aliases, configuration, and the comparator registry

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::MemTracker;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page id: an unsigned 64-bit self-pointer (byte offset of the page)
pub type PageId = u64;

/// Blob id: the page id of the first page of a blob chain
pub type BlobId = u64;

/// Cursor id within the database's cursor table
pub type CursorId = u64;

/// Transaction counter
pub type TxnId = u64;

/// Width of a slot pointer word; records up to this size are inlined
pub const PTR_SIZE: usize = 8;

/// Smallest accepted page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Largest accepted page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Default in-node key width
pub const DEFAULT_KEY_SIZE: u16 = 32;

/// Default number of resident pages in file mode before eviction starts
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

// ============================================================================
// Comparator registry
// ============================================================================

/// Total order over key bytes.
///
/// The default compares bytewise with shorter-is-smaller as the tiebreak.
/// A custom comparator may refuse a comparison by returning `None`; callers
/// see that as `CompareFailed`.
#[derive(Clone)]
pub enum KeyComparator {
    /// Bytewise comparison (memcmp, default)
    Lexicographic,
    /// Custom total order with a name and comparison callback
    Custom {
        name: String,
        cmp: Arc<dyn Fn(&[u8], &[u8]) -> Option<Ordering> + Send + Sync>,
    },
}

impl KeyComparator {
    /// Compare two keys using this order
    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Result<Ordering> {
        match self {
            KeyComparator::Lexicographic => Ok(lhs.cmp(rhs)),
            KeyComparator::Custom { cmp, .. } => cmp(lhs, rhs)
                .ok_or_else(|| Error::new(ErrorCode::CompareFailed)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            KeyComparator::Lexicographic => "LEXICOGRAPHIC",
            KeyComparator::Custom { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for KeyComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyComparator({})", self.name())
    }
}

impl Default for KeyComparator {
    fn default() -> Self {
        KeyComparator::Lexicographic
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Parameters for creating or opening a database.
#[derive(Clone, Debug)]
pub struct Config {
    /// Page size in bytes; a power of two in [512, 65536]
    pub page_size: u32,
    /// In-node key width; longer keys are rejected with `InvKeysize`
    pub key_size: u16,
    /// Resident page budget in file mode; ignored for in-memory images
    pub cache_capacity: usize,
    /// Active total order over key bytes
    pub comparator: KeyComparator,
    /// Optional allocation-accounting capability
    pub tracker: Option<Arc<MemTracker>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: DEFAULT_PAGE_SIZE,
            key_size: DEFAULT_KEY_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            comparator: KeyComparator::default(),
            tracker: None,
        }
    }
}

impl Config {
    /// Validate page and key sizes against the node layout limits.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::with_message(
                ErrorCode::InvPagesize,
                format!("got {}", self.page_size),
            ));
        }
        if self.key_size == 0 {
            return Err(Error::new(ErrorCode::InvKeysize));
        }
        if crate::storage::btree::node::max_keys(self.page_size, self.key_size) < 2 {
            return Err(Error::with_message(
                ErrorCode::InvKeysize,
                format!(
                    "key size {} leaves fewer than 2 slots per {}-byte page",
                    self.key_size, self.page_size
                ),
            ));
        }
        Ok(())
    }
}
