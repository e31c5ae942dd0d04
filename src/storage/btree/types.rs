//! B+-tree type definitions, constants, and bitflags

use bitflags::bitflags;

bitflags! {
    /// Flag bits stored on a leaf slot.
    ///
    /// The three size flags are mutually exclusive and mark a record that is
    /// inlined into the slot pointer word instead of living in a blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        /// Record shorter than the pointer word; length in the word's last byte
        const TINY = 0x01;
        /// Record exactly as long as the pointer word
        const SMALL = 0x02;
        /// Record of zero bytes
        const EMPTY = 0x04;
    }
}

impl SlotFlags {
    /// True when the pointer word holds an allocated blob id.
    pub fn is_blob(self) -> bool {
        !self.intersects(SlotFlags::TINY | SlotFlags::SMALL | SlotFlags::EMPTY)
    }
}

bitflags! {
    /// Public insert flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Replace the record when the key already exists
        const OVERWRITE = 0x0001;
    }
}

bitflags! {
    /// Slot-level insert flags used inside the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeInsertFlags: u8 {
        /// Tolerate an exact match without failing
        const OVERWRITE = 0x01;
        /// Page write-back is handled by the enclosing split protocol
        const NOFLUSH = 0x02;
    }
}

bitflags! {
    /// What a cursor move should copy out for the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Fetch: u8 {
        const KEY = 0x01;
        const RECORD = 0x02;
    }
}

/// Seed or step direction for a cursor move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    First,
    Last,
    Next,
    Previous,
}

/// Result of an ordered slot lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSearch {
    /// The key exists at this slot index
    Exact(u16),
    /// The key is absent; this is the index it would be inserted at
    Insert(u16),
}
