//! In-page node layout and slot operations
//!
//! A node page is a node header followed by a packed array of fixed-stride
//! slots. The last byte of the slot header overlaps the first key byte, so
//! the stride is `SLOT_HEADER_SIZE - 1 + key_size`; every code path that
//! addresses slots (insert, split, shift, read) goes through the one
//! `slot_base` calculation below.
//!
//! Node header layout (little-endian):
//!
//! | offset | field                  |
//! |--------|------------------------|
//! | 0      | page type tag (u8)     |
//! | 1      | leaf flag (u8)         |
//! | 2      | entry count (u16)      |
//! | 4      | reserved (u32)         |
//! | 8      | left sibling id (u64)  |
//! | 16     | right sibling id (u64) |
//! | 24     | left-pointer id (u64)  |
//!
//! Slot layout: pointer word (u64) at 0, key length (u16) at 8, flag bits
//! (u8) at 10, key bytes (zero-padded to `key_size`) at 11.

use crate::error::Result;
use crate::storage::btree::types::{SlotFlags, SlotSearch};
use crate::storage::pager::Page;
use crate::types::{KeyComparator, PageId};

pub const NODE_HEADER_SIZE: usize = 32;
pub const SLOT_HEADER_SIZE: usize = 12;

const OFF_LEAF: usize = 1;
const OFF_COUNT: usize = 2;
const OFF_LEFT: usize = 8;
const OFF_RIGHT: usize = 16;
const OFF_PTR_LEFT: usize = 24;

const SLOT_PTR: usize = 0;
const SLOT_KEY_LEN: usize = 8;
const SLOT_FLAGS: usize = 10;
const SLOT_KEY: usize = 11;

/// Distance between consecutive slots for the given key width.
pub fn stride(key_size: u16) -> usize {
    SLOT_HEADER_SIZE - 1 + key_size as usize
}

/// Number of slots that fit in a page of the given size.
pub fn max_keys(page_size: u32, key_size: u16) -> u16 {
    let fit = (page_size as usize - NODE_HEADER_SIZE) / stride(key_size);
    fit.min(u16::MAX as usize) as u16
}

fn slot_base(key_size: u16, index: u16) -> usize {
    NODE_HEADER_SIZE + index as usize * stride(key_size)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap_or([0; 8]))
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Node header accessors
// ============================================================================

/// Reset the node header of a freshly allocated page.
pub fn init(page: &mut Page, leaf: bool) {
    page.data[OFF_LEAF] = leaf as u8;
    write_u16(&mut page.data, OFF_COUNT, 0);
    write_u64(&mut page.data, OFF_LEFT, 0);
    write_u64(&mut page.data, OFF_RIGHT, 0);
    write_u64(&mut page.data, OFF_PTR_LEFT, 0);
}

pub fn count(page: &Page) -> u16 {
    read_u16(&page.data, OFF_COUNT)
}

pub fn set_count(page: &mut Page, count: u16) {
    write_u16(&mut page.data, OFF_COUNT, count);
}

pub fn is_leaf(page: &Page) -> bool {
    page.data[OFF_LEAF] != 0
}

pub fn left(page: &Page) -> PageId {
    read_u64(&page.data, OFF_LEFT)
}

pub fn set_left(page: &mut Page, id: PageId) {
    write_u64(&mut page.data, OFF_LEFT, id);
}

pub fn right(page: &Page) -> PageId {
    read_u64(&page.data, OFF_RIGHT)
}

pub fn set_right(page: &mut Page, id: PageId) {
    write_u64(&mut page.data, OFF_RIGHT, id);
}

pub fn ptr_left(page: &Page) -> PageId {
    read_u64(&page.data, OFF_PTR_LEFT)
}

pub fn set_ptr_left(page: &mut Page, id: PageId) {
    write_u64(&mut page.data, OFF_PTR_LEFT, id);
}

// ============================================================================
// Slot accessors
// ============================================================================

pub fn key_len(page: &Page, key_size: u16, index: u16) -> u16 {
    read_u16(&page.data, slot_base(key_size, index) + SLOT_KEY_LEN)
}

/// The stored key bytes, trimmed to the stored length.
pub fn key_bytes<'a>(page: &'a Page, key_size: u16, index: u16) -> &'a [u8] {
    let base = slot_base(key_size, index);
    let len = (key_len(page, key_size, index) as usize).min(key_size as usize);
    &page.data[base + SLOT_KEY..base + SLOT_KEY + len]
}

/// Store the key bytes and length, zero-padding the slot's key area.
pub fn set_key(page: &mut Page, key_size: u16, index: u16, key: &[u8]) {
    debug_assert!(key.len() <= key_size as usize);
    let base = slot_base(key_size, index);
    write_u16(&mut page.data, base + SLOT_KEY_LEN, key.len() as u16);
    let area = &mut page.data[base + SLOT_KEY..base + SLOT_KEY + key_size as usize];
    area[..key.len()].copy_from_slice(key);
    for b in &mut area[key.len()..] {
        *b = 0;
    }
}

pub fn slot_flags(page: &Page, key_size: u16, index: u16) -> SlotFlags {
    SlotFlags::from_bits_truncate(page.data[slot_base(key_size, index) + SLOT_FLAGS])
}

pub fn set_slot_flags(page: &mut Page, key_size: u16, index: u16, flags: SlotFlags) {
    page.data[slot_base(key_size, index) + SLOT_FLAGS] = flags.bits();
}

/// The pointer word as a page/blob id.
pub fn slot_ptr(page: &Page, key_size: u16, index: u16) -> u64 {
    read_u64(&page.data, slot_base(key_size, index) + SLOT_PTR)
}

pub fn set_slot_ptr(page: &mut Page, key_size: u16, index: u16, ptr: u64) {
    write_u64(&mut page.data, slot_base(key_size, index) + SLOT_PTR, ptr);
}

/// The pointer word as raw bytes (inlined-record encodings).
pub fn ptr_word(page: &Page, key_size: u16, index: u16) -> [u8; 8] {
    let base = slot_base(key_size, index) + SLOT_PTR;
    page.data[base..base + 8].try_into().unwrap_or([0; 8])
}

pub fn set_ptr_word(page: &mut Page, key_size: u16, index: u16, word: [u8; 8]) {
    let base = slot_base(key_size, index) + SLOT_PTR;
    page.data[base..base + 8].copy_from_slice(&word);
}

// ============================================================================
// Slot shifting and bulk movement
// ============================================================================

/// Open slot `index` by moving slots `[index, count)` one stride to the
/// right. The caller writes the slot and bumps the count afterwards.
pub fn shift_right(page: &mut Page, key_size: u16, index: u16, count: u16) {
    if index >= count {
        return;
    }
    let from = slot_base(key_size, index);
    let to = slot_base(key_size, count);
    page.data.copy_within(from..to, from + stride(key_size));
}

/// Close slot `index` by moving slots `[index + 1, count)` one stride to the
/// left. The caller drops the count afterwards.
pub fn shift_left(page: &mut Page, key_size: u16, index: u16, count: u16) {
    if index + 1 >= count {
        return;
    }
    let from = slot_base(key_size, index + 1);
    let to = slot_base(key_size, count);
    page.data.copy_within(from..to, slot_base(key_size, index));
}

/// Copy `n` raw slots starting at `from` out of the page.
pub fn read_slots(page: &Page, key_size: u16, from: u16, n: u16) -> Vec<u8> {
    let start = slot_base(key_size, from);
    let end = start + n as usize * stride(key_size);
    page.data[start..end].to_vec()
}

/// Paste raw slot bytes at slot position `at`.
pub fn write_slots(page: &mut Page, key_size: u16, at: u16, raw: &[u8]) {
    let start = slot_base(key_size, at);
    page.data[start..start + raw.len()].copy_from_slice(raw);
}

// ============================================================================
// Ordered lookup
// ============================================================================

/// Locate the smallest slot index whose key is greater than or equal to
/// `key`. A linear scan, matching the reference implementation; the
/// comparator's failure is surfaced unchanged.
pub fn search(
    page: &Page,
    key_size: u16,
    cmp: &KeyComparator,
    key: &[u8],
) -> Result<SlotSearch> {
    let n = count(page);
    for i in 0..n {
        match cmp.compare(key_bytes(page, key_size, i), key)? {
            std::cmp::Ordering::Equal => return Ok(SlotSearch::Exact(i)),
            std::cmp::Ordering::Greater => return Ok(SlotSearch::Insert(i)),
            std::cmp::Ordering::Less => {}
        }
    }
    Ok(SlotSearch::Insert(n))
}

/// Pick the child covering `key` in an internal node: the left-pointer when
/// the key sorts before slot 0, otherwise the child of the greatest slot key
/// not exceeding `key`.
pub fn locate_child(
    page: &Page,
    key_size: u16,
    cmp: &KeyComparator,
    key: &[u8],
) -> Result<PageId> {
    debug_assert!(!is_leaf(page));
    match search(page, key_size, cmp, key)? {
        SlotSearch::Exact(i) => Ok(slot_ptr(page, key_size, i)),
        SlotSearch::Insert(0) => Ok(ptr_left(page)),
        SlotSearch::Insert(i) => Ok(slot_ptr(page, key_size, i - 1)),
    }
}
