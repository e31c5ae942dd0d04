//! B+-tree engine
//!
//! Recursive insert with split propagation, key-driven erase, exact-match
//! find, and the record codec shared by the cursor machinery. Splits hand
//! their pivot upward through a scratchpad, mirroring the recursion: a split
//! at depth N inserts a freshly copied pivot key and the new sibling's page
//! id into the node at depth N-1, and a split of the root grows the tree by
//! one level.

pub mod cursor;
pub mod node;
pub mod types;

use std::cmp::Ordering;

use log::{debug, trace};

use crate::db::DbState;
use crate::error::{Error, ErrorCode, Result};
use crate::storage::blob;
use crate::storage::btree::types::{InsertFlags, NodeInsertFlags, SlotFlags, SlotSearch};
use crate::storage::pager::PageKind;
use crate::types::{PageId, PTR_SIZE};

/// Outcome of one level of the recursive insert.
enum InsertOutcome {
    Done,
    /// The child split; the scratchpad holds the pivot key and page id
    Split,
}

/// Propagates split results from the bottom of the recursion to the root.
struct Scratchpad<'a> {
    record: &'a [u8],
    pivot_key: Option<Vec<u8>>,
    pivot_rid: PageId,
}

pub(crate) fn validate_key(state: &DbState, key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::with_message(
            ErrorCode::InvParameter,
            "key must not be empty",
        ));
    }
    if key.len() > state.key_size as usize {
        return Err(Error::with_message(
            ErrorCode::InvKeysize,
            format!("key of {} bytes exceeds key size {}", key.len(), state.key_size),
        ));
    }
    Ok(())
}

/// Pin a page across `f` so that pager fetches triggered inside cannot evict
/// it; the pin is dropped on every exit path.
pub(crate) fn with_pinned<T>(
    state: &mut DbState,
    id: PageId,
    f: impl FnOnce(&mut DbState) -> Result<T>,
) -> Result<T> {
    state.pager.pin(id)?;
    let result = f(state);
    state.pager.unpin(id);
    result
}

// ============================================================================
// Traversal
// ============================================================================

/// Descend from the root to the leaf that covers `key`. Never modifies
/// nodes.
pub(crate) fn find_leaf(state: &mut DbState, key: &[u8]) -> Result<PageId> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();
    let mut page_id = state.root_page;
    loop {
        let next = {
            let page = state.fetch_page(page_id)?;
            if node::is_leaf(page) {
                return Ok(page_id);
            }
            node::locate_child(page, ks, &cmp, key)?
        };
        page_id = next;
    }
}

/// Exact-match lookup returning the leaf page and slot index, or `None`.
pub(crate) fn find_slot(state: &mut DbState, key: &[u8]) -> Result<Option<(PageId, u16)>> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();
    let leaf = find_leaf(state, key)?;
    let search = {
        let page = state.fetch_page(leaf)?;
        node::search(page, ks, &cmp, key)?
    };
    match search {
        SlotSearch::Exact(index) => Ok(Some((leaf, index))),
        SlotSearch::Insert(_) => Ok(None),
    }
}

/// Exact-match lookup returning the record bytes.
pub(crate) fn lookup(state: &mut DbState, key: &[u8]) -> Result<Vec<u8>> {
    validate_key(state, key)?;
    let (leaf, index) = find_slot(state, key)?.ok_or(Error::new(ErrorCode::KeyNotFound))?;
    with_pinned(state, leaf, |state| read_record(state, leaf, index))
}

// ============================================================================
// Record codec
// ============================================================================

/// Copy the key at a slot into a caller-owned buffer.
pub(crate) fn read_key(state: &mut DbState, page_id: PageId, index: u16) -> Result<Vec<u8>> {
    let ks = state.key_size;
    let page = state.fetch_page(page_id)?;
    Ok(node::key_bytes(page, ks, index).to_vec())
}

/// Decode the record at a leaf slot. The flags are consulted before the
/// pointer word: EMPTY yields zero bytes, TINY takes its length from the
/// word's last byte, SMALL is exactly the word, and bare slots fetch a blob.
pub(crate) fn read_record(state: &mut DbState, page_id: PageId, index: u16) -> Result<Vec<u8>> {
    let ks = state.key_size;
    let (flags, word) = {
        let page = state.fetch_page(page_id)?;
        (
            node::slot_flags(page, ks, index),
            node::ptr_word(page, ks, index),
        )
    };
    if flags.contains(SlotFlags::EMPTY) {
        Ok(Vec::new())
    } else if flags.contains(SlotFlags::TINY) {
        let len = word[PTR_SIZE - 1] as usize;
        if len >= PTR_SIZE {
            return Err(Error::new(ErrorCode::Internal));
        }
        Ok(word[..len].to_vec())
    } else if flags.contains(SlotFlags::SMALL) {
        Ok(word.to_vec())
    } else {
        blob::read(state, u64::from_le_bytes(word))
    }
}

/// Replace the record at a leaf slot in place, handling all three inlined
/// encodings and the blob case. This is the single record mutator: both the
/// cursor overwrite operation and insert-with-OVERWRITE go through it.
pub(crate) fn replace_record(
    state: &mut DbState,
    page_id: PageId,
    index: u16,
    record: &[u8],
) -> Result<()> {
    let ks = state.key_size;
    let (old_flags, old_word) = {
        let page = state.fetch_page(page_id)?;
        (
            node::slot_flags(page, ks, index),
            node::ptr_word(page, ks, index),
        )
    };
    let old_blob = if old_flags.is_blob() {
        Some(u64::from_le_bytes(old_word))
    } else {
        None
    };

    let mut word = [0u8; PTR_SIZE];
    let mut flags = SlotFlags::empty();
    if record.is_empty() {
        if let Some(id) = old_blob {
            state.extkeys.remove(id);
            blob::free(state, id)?;
        }
        flags = SlotFlags::EMPTY;
    } else if record.len() > PTR_SIZE {
        let rid = match old_blob {
            // there is a blob to replace; it may relocate
            Some(id) => {
                state.extkeys.remove(id);
                blob::overwrite(state, id, record)?
            }
            None => blob::allocate(state, record)?,
        };
        word = rid.to_le_bytes();
    } else {
        if let Some(id) = old_blob {
            state.extkeys.remove(id);
            blob::free(state, id)?;
        }
        word[..record.len()].copy_from_slice(record);
        if record.len() < PTR_SIZE {
            word[PTR_SIZE - 1] = record.len() as u8;
            flags = SlotFlags::TINY;
        } else {
            flags = SlotFlags::SMALL;
        }
    }

    let page = state.page_for_write(page_id)?;
    node::set_ptr_word(page, ks, index, word);
    node::set_slot_flags(page, ks, index, flags);
    Ok(())
}

// ============================================================================
// Insert engine
// ============================================================================

/// Insert a key/record pair, splitting as needed. When `cur` is given the
/// cursor ends up coupled to the slot that holds the key.
pub(crate) fn insert(
    state: &mut DbState,
    cur: Option<crate::types::CursorId>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    validate_key(state, key)?;
    trace!("insert key={} ({} record bytes)", hex::encode(key), record.len());

    // An existing key with OVERWRITE replaces the record in place through
    // the one record mutator; the key bytes and length stay untouched.
    if flags.contains(InsertFlags::OVERWRITE) {
        if let Some((leaf, index)) = find_slot(state, key)? {
            with_pinned(state, leaf, |state| replace_record(state, leaf, index, record))?;
            if let Some(cid) = cur {
                cursor::set_to_nil(state, cid)?;
                cursor::couple_to(state, cid, leaf, index)?;
            }
            return Ok(());
        }
    }

    let root = state.root_page;
    let mut sp = Scratchpad {
        record,
        pivot_key: None,
        pivot_rid: 0,
    };
    let outcome = insert_recursive(state, root, key, 0, &mut sp)?;

    if let InsertOutcome::Split = outcome {
        // The root itself split: grow the tree by one level. The old root
        // stays reachable through the new root's left-pointer.
        let new_root = state.alloc_page(PageKind::Root)?;
        {
            let page = state.pager.cached_mut(new_root)?;
            node::init(page, false);
            node::set_ptr_left(page, root);
        }
        let pivot = sp.pivot_key.take().ok_or(Error::new(ErrorCode::Internal))?;
        insert_nosplit(
            state,
            new_root,
            &pivot,
            sp.pivot_rid,
            record,
            NodeInsertFlags::NOFLUSH,
        )?;
        state.set_root(new_root)?;
        // the old root is retyped to an ordinary index page, never freed
        {
            let page = state.page_for_write(root)?;
            page.kind = PageKind::Index;
            page.data[0] = PageKind::Index.tag();
        }
        debug!("root split: new root {} above {}", new_root, root);
    }

    if let Some(cid) = cur {
        let (leaf, index) =
            find_slot(state, key)?.ok_or(Error::new(ErrorCode::Internal))?;
        cursor::set_to_nil(state, cid)?;
        cursor::couple_to(state, cid, leaf, index)?;
    }
    Ok(())
}

fn insert_recursive(
    state: &mut DbState,
    page_id: PageId,
    key: &[u8],
    rid: u64,
    sp: &mut Scratchpad<'_>,
) -> Result<InsertOutcome> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();

    let (is_leaf, child) = {
        let page = state.fetch_page(page_id)?;
        if node::is_leaf(page) {
            (true, 0)
        } else {
            (false, node::locate_child(page, ks, &cmp, key)?)
        }
    };
    if is_leaf {
        return insert_in_page(state, page_id, key, rid, NodeInsertFlags::empty(), sp);
    }

    match insert_recursive(state, child, key, rid, sp)? {
        InsertOutcome::Done => Ok(InsertOutcome::Done),
        InsertOutcome::Split => {
            // the child split: insert the pivot it left in the scratchpad.
            // Taking the key out frees it before a split at this level
            // stores its own pivot.
            let pivot = sp.pivot_key.take().ok_or(Error::new(ErrorCode::Internal))?;
            let pivot_rid = sp.pivot_rid;
            insert_in_page(state, page_id, &pivot, pivot_rid, NodeInsertFlags::OVERWRITE, sp)
        }
    }
}

fn insert_in_page(
    state: &mut DbState,
    page_id: PageId,
    key: &[u8],
    rid: u64,
    flags: NodeInsertFlags,
    sp: &mut Scratchpad<'_>,
) -> Result<InsertOutcome> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();
    let max_keys = state.max_keys;
    debug_assert!(max_keys > 1);

    let count = node::count(state.fetch_page(page_id)?);
    if count < max_keys {
        insert_nosplit(state, page_id, key, rid, sp.record, flags)?;
        return Ok(InsertOutcome::Done);
    }

    // The page is full. Before splitting, check whether the key already
    // exists: a failed insert must leave the tree structurally unchanged.
    let search = {
        let page = state.fetch_page(page_id)?;
        node::search(page, ks, &cmp, key)?
    };
    if let SlotSearch::Exact(_) = search {
        if flags.contains(NodeInsertFlags::OVERWRITE) {
            insert_nosplit(state, page_id, key, rid, sp.record, flags)?;
            return Ok(InsertOutcome::Done);
        }
        return Err(Error::new(ErrorCode::DuplicateKey));
    }

    insert_split(state, page_id, key, rid, flags, sp)
}

/// Slot-level writer; the page must have a free slot.
fn insert_nosplit(
    state: &mut DbState,
    page_id: PageId,
    key: &[u8],
    rid: u64,
    record: &[u8],
    flags: NodeInsertFlags,
) -> Result<()> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();

    let (count, is_leaf, search) = {
        let page = state.fetch_page(page_id)?;
        (
            node::count(page),
            node::is_leaf(page),
            node::search(page, ks, &cmp, key)?,
        )
    };
    let index = match search {
        SlotSearch::Exact(_) => {
            if flags.contains(NodeInsertFlags::OVERWRITE) {
                // the key is already present; record replacement is the
                // overwrite path's job
                return Ok(());
            }
            return Err(Error::new(ErrorCode::DuplicateKey));
        }
        SlotSearch::Insert(index) => index,
    };

    // Materialize the record before touching the page: a failed blob
    // allocation leaves the node unchanged.
    let mut word = [0u8; PTR_SIZE];
    let mut slot_flags = SlotFlags::empty();
    if is_leaf {
        if record.len() > PTR_SIZE {
            let blob_id = blob::allocate(state, record)?;
            word = blob_id.to_le_bytes();
        } else if record.is_empty() {
            slot_flags = SlotFlags::EMPTY;
        } else {
            word[..record.len()].copy_from_slice(record);
            if record.len() < PTR_SIZE {
                word[PTR_SIZE - 1] = record.len() as u8;
                slot_flags = SlotFlags::TINY;
            } else {
                slot_flags = SlotFlags::SMALL;
            }
        }
    } else {
        word = rid.to_le_bytes();
    }

    // Coupled cursors at or past the opened slot move one to the right.
    cursor::adjust_for_insert(state, page_id, index)?;

    let page = state.page_for_write(page_id)?;
    node::shift_right(page, ks, index, count);
    node::set_ptr_word(page, ks, index, word);
    node::set_slot_flags(page, ks, index, slot_flags);
    node::set_key(page, ks, index, key);
    node::set_count(page, count + 1);

    if !flags.contains(NodeInsertFlags::NOFLUSH) {
        state.flush_page(page_id)?;
    }
    Ok(())
}

/// Split a full node at pivot `count / 2` and insert the new element into
/// the correct half. Leaves keep the pivot slot in the new right sibling;
/// internal nodes consume it: its key moves up and its pointer becomes the
/// sibling's left-pointer.
fn insert_split(
    state: &mut DbState,
    page_id: PageId,
    key: &[u8],
    rid: u64,
    flags: NodeInsertFlags,
    sp: &mut Scratchpad<'_>,
) -> Result<InsertOutcome> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();

    let (count, is_leaf, old_right) = {
        let page = state.fetch_page(page_id)?;
        (node::count(page), node::is_leaf(page), node::right(page))
    };
    let pivot = count / 2;

    // Allocate the sibling before any mutation: an allocation failure here
    // must surface before the sibling chain is edited.
    let new_id = state.alloc_page(if is_leaf { PageKind::Leaf } else { PageKind::Index })?;
    {
        let page = state.pager.cached_mut(new_id)?;
        node::init(page, is_leaf);
    }

    let (pivot_key, raw_slots, new_count, new_ptr_left) = {
        let page = state.fetch_page(page_id)?;
        let pivot_key = node::key_bytes(page, ks, pivot).to_vec();
        if is_leaf {
            let raw = node::read_slots(page, ks, pivot, count - pivot);
            (pivot_key, raw, count - pivot, None)
        } else {
            let raw = node::read_slots(page, ks, pivot + 1, count - pivot - 1);
            let left = node::slot_ptr(page, ks, pivot);
            (pivot_key, raw, count - pivot - 1, Some(left))
        }
    };
    {
        let page = state.page_for_write(new_id)?;
        node::write_slots(page, ks, 0, &raw_slots);
        node::set_count(page, new_count);
        if let Some(left) = new_ptr_left {
            node::set_ptr_left(page, left);
        }
    }
    {
        let page = state.page_for_write(page_id)?;
        node::set_count(page, pivot);
    }

    // Cursors coupled at or past the pivot re-couple to the new sibling.
    if is_leaf {
        cursor::adjust_for_split(state, page_id, new_id, pivot)?;
    }

    // A key not below the pivot goes into the new right sibling.
    let target = if cmp.compare(&pivot_key, key)? != Ordering::Greater {
        new_id
    } else {
        page_id
    };
    insert_nosplit(state, target, key, rid, sp.record, flags | NodeInsertFlags::NOFLUSH)?;

    // Splice the sibling chain; the order keeps every intermediate state
    // consistent under cooperative interleaving.
    {
        let page = state.page_for_write(new_id)?;
        node::set_left(page, page_id);
        node::set_right(page, old_right);
    }
    if old_right != 0 {
        let page = state.page_for_write(old_right)?;
        node::set_left(page, new_id);
    }
    {
        let page = state.page_for_write(page_id)?;
        node::set_right(page, new_id);
    }

    debug!(
        "split page {} at pivot {}: sibling {} takes {} keys",
        page_id, pivot, new_id, new_count
    );
    sp.pivot_key = Some(pivot_key);
    sp.pivot_rid = new_id;
    Ok(InsertOutcome::Split)
}

// ============================================================================
// Erase engine
// ============================================================================

/// Remove a key and its record from the tree. No merge or redistribution:
/// a leaf may become empty and stays in the sibling chain; traversal skips
/// it. Internal slots are never removed, so erased keys may live on as
/// routing separators.
pub(crate) fn erase(state: &mut DbState, key: &[u8]) -> Result<()> {
    validate_key(state, key)?;
    let (leaf, index) = find_slot(state, key)?.ok_or(Error::new(ErrorCode::KeyNotFound))?;
    let ks = state.key_size;

    let (count, flags, word) = {
        let page = state.fetch_page(leaf)?;
        (
            node::count(page),
            node::slot_flags(page, ks, index),
            node::ptr_word(page, ks, index),
        )
    };
    if flags.is_blob() {
        let blob_id = u64::from_le_bytes(word);
        state.extkeys.remove(blob_id);
        blob::free(state, blob_id)?;
    }

    // Same uncoupling hook the pager applies before eviction: every cursor
    // on this page captures its key and lets go of the slot index.
    cursor::uncouple_all(state, leaf)?;

    let page = state.page_for_write(leaf)?;
    node::shift_left(page, ks, index, count);
    node::set_count(page, count - 1);
    trace!("erased key={} from page {}", hex::encode(key), leaf);
    Ok(())
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Number of levels from the root down to (and including) the leaves.
pub(crate) fn tree_depth(state: &mut DbState) -> Result<usize> {
    let mut depth = 1;
    let mut page_id = state.root_page;
    loop {
        let (is_leaf, left) = {
            let page = state.fetch_page(page_id)?;
            (node::is_leaf(page), node::ptr_left(page))
        };
        if is_leaf {
            return Ok(depth);
        }
        depth += 1;
        page_id = left;
    }
}

/// Verify the ordering and routing invariants of every node, the sibling
/// chain of the leaf level, and the bookkeeping of every cursor.
pub(crate) fn check_integrity(state: &mut DbState) -> Result<()> {
    let root = state.root_page;
    check_node(state, root, None, None)?;
    check_leaf_chain(state)?;
    cursor::check_cursors(state)
}

fn check_node(
    state: &mut DbState,
    page_id: PageId,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
) -> Result<()> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();

    let (is_leaf, keys, children, ptr_left) = {
        let page = state.fetch_page(page_id)?;
        let n = node::count(page);
        let keys: Vec<Vec<u8>> = (0..n).map(|i| node::key_bytes(page, ks, i).to_vec()).collect();
        let children: Vec<u64> = if node::is_leaf(page) {
            Vec::new()
        } else {
            (0..n).map(|i| node::slot_ptr(page, ks, i)).collect()
        };
        (node::is_leaf(page), keys, children, node::ptr_left(page))
    };

    for pair in keys.windows(2) {
        if cmp.compare(&pair[0], &pair[1])? != Ordering::Less {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {}: keys out of order", page_id),
            ));
        }
    }
    if let (Some(lower), Some(first)) = (lower, keys.first()) {
        if cmp.compare(lower, first)? == Ordering::Greater {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {}: key below its lower bound", page_id),
            ));
        }
    }
    if let (Some(upper), Some(last)) = (upper, keys.last()) {
        if cmp.compare(last, upper)? != Ordering::Less {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {}: key at or above its upper bound", page_id),
            ));
        }
    }

    if !is_leaf {
        if keys.is_empty() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {}: internal node with no keys", page_id),
            ));
        }
        check_node(state, ptr_left, lower, Some(keys[0].as_slice()))?;
        for (i, &child) in children.iter().enumerate() {
            let upper_bound = keys.get(i + 1).map(|k| k.as_slice()).or(upper);
            check_node(state, child, Some(keys[i].as_slice()), upper_bound)?;
        }
    }
    Ok(())
}

fn check_leaf_chain(state: &mut DbState) -> Result<()> {
    let ks = state.key_size;
    let cmp = state.comparator.clone();

    // descend to the leftmost leaf
    let mut page_id = state.root_page;
    loop {
        let (is_leaf, left) = {
            let page = state.fetch_page(page_id)?;
            (node::is_leaf(page), node::ptr_left(page))
        };
        if is_leaf {
            break;
        }
        page_id = left;
    }

    let mut prev_id: PageId = 0;
    let mut prev_last: Option<Vec<u8>> = None;
    loop {
        let (count, left, right) = {
            let page = state.fetch_page(page_id)?;
            (node::count(page), node::left(page), node::right(page))
        };
        if left != prev_id {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("leaf {}: broken left link", page_id),
            ));
        }
        if count > 0 {
            let first = read_key(state, page_id, 0)?;
            if let Some(prev) = &prev_last {
                if cmp.compare(prev, &first)? != Ordering::Less {
                    return Err(Error::with_message(
                        ErrorCode::Internal,
                        format!("leaf {}: not above its left sibling", page_id),
                    ));
                }
            }
            prev_last = Some(read_key(state, page_id, count - 1)?);
        }
        if right == 0 {
            return Ok(());
        }
        prev_id = page_id;
        page_id = right;
    }
}
