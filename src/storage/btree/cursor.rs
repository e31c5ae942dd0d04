//! B+-tree cursors
//!
//! A cursor is a caller-owned handle whose position lives in the database's
//! cursor table, keyed by cursor id. Exactly one of three modes holds at any
//! instant:
//!
//! - NIL: no position.
//! - COUPLED: a leaf page id and a slot index; the cursor id is linked into
//!   that page's cursor list so structural modifications can fix it up.
//! - UNCOUPLED: an owned copy of the last key; the page reference is gone
//!   and the cursor re-couples through a lookup before further use.
//!
//! Every code path that moves or evicts a page visits the page's cursor list
//! and either fixes the coupled indices or forces an uncouple.

use std::sync::{Arc, RwLock, Weak};

use crate::db::{with_local_txn, DbState};
use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::types::{Direction, Fetch, InsertFlags};
use crate::storage::btree::{self, node};
use crate::types::{CursorId, PageId};

/// Position of a cursor.
pub(crate) enum CursorPos {
    Nil,
    Coupled {
        page: PageId,
        index: u16,
        /// Reserved for duplicate-key chains; always zero
        dupe_id: u64,
    },
    Uncoupled {
        key: Vec<u8>,
    },
}

/// All cursor positions of a database, keyed by cursor id. The insertion
/// order list mirrors the database-level cursor chain: new cursors are
/// linked at the head.
pub(crate) struct CursorTable {
    next_id: CursorId,
    slots: std::collections::HashMap<CursorId, CursorPos>,
    list: Vec<CursorId>,
}

impl CursorTable {
    pub fn new() -> Self {
        CursorTable {
            next_id: 1,
            slots: std::collections::HashMap::new(),
            list: Vec::new(),
        }
    }

    /// Register a new NIL cursor at the head of the list.
    pub fn create(&mut self) -> CursorId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, CursorPos::Nil);
        self.list.insert(0, id);
        id
    }

    pub fn pos(&self, id: CursorId) -> Result<&CursorPos> {
        self.slots
            .get(&id)
            .ok_or(Error::new(ErrorCode::NotInitialized))
    }

    pub fn pos_mut(&mut self, id: CursorId) -> Result<&mut CursorPos> {
        self.slots
            .get_mut(&id)
            .ok_or(Error::new(ErrorCode::NotInitialized))
    }

    /// Detach a cursor from the table and the database-level list.
    pub fn remove(&mut self, id: CursorId) -> Option<CursorPos> {
        self.list.retain(|&c| c != id);
        self.slots.remove(&id)
    }

    pub fn ids(&self) -> Vec<CursorId> {
        self.list.clone()
    }

    /// Release the key buffers of uncoupled cursors (database teardown).
    pub fn release_buffers(&mut self, tracker: &crate::mem::MemTracker) {
        for pos in self.slots.values_mut() {
            if let CursorPos::Uncoupled { key } = pos {
                tracker.release(key.len());
                *key = Vec::new();
            }
        }
    }
}

// ============================================================================
// State transitions
// ============================================================================

/// Transition to NIL from any mode, releasing the owned key or the page
/// list entry.
pub(crate) fn set_to_nil(state: &mut DbState, cid: CursorId) -> Result<()> {
    let pos = std::mem::replace(state.cursors.pos_mut(cid)?, CursorPos::Nil);
    match pos {
        CursorPos::Uncoupled { key } => state.tracker.release(key.len()),
        CursorPos::Coupled { page, .. } => {
            if let Ok(p) = state.pager.cached_mut(page) {
                p.cursors.retain(|&c| c != cid);
            }
        }
        CursorPos::Nil => {}
    }
    Ok(())
}

/// Couple a NIL cursor to a leaf slot and register it on the page.
pub(crate) fn couple_to(
    state: &mut DbState,
    cid: CursorId,
    page_id: PageId,
    index: u16,
) -> Result<()> {
    debug_assert!(matches!(state.cursors.pos(cid)?, CursorPos::Nil));
    state.pager.cached_mut(page_id)?.cursors.push(cid);
    *state.cursors.pos_mut(cid)? = CursorPos::Coupled {
        page: page_id,
        index,
        dupe_id: 0,
    };
    Ok(())
}

/// Copy the current key into an owned buffer and let go of the page. With
/// `no_remove` the page's cursor list is left alone; the caller is walking
/// the list itself and will not observe removals.
pub(crate) fn uncouple(state: &mut DbState, cid: CursorId, no_remove: bool) -> Result<()> {
    let (page_id, index) = match state.cursors.pos(cid)? {
        CursorPos::Coupled { page, index, .. } => (*page, *index),
        // already uncoupled or nil
        _ => return Ok(()),
    };
    let ks = state.key_size;
    let key = {
        let page = state.pager.cached(page_id)?;
        debug_assert!(node::is_leaf(page));
        node::key_bytes(page, ks, index).to_vec()
    };
    state.tracker.allocate(key.len())?;
    if !no_remove {
        state.pager.cached_mut(page_id)?.cursors.retain(|&c| c != cid);
    }
    *state.cursors.pos_mut(cid)? = CursorPos::Uncoupled { key };
    Ok(())
}

/// Force-uncouple every cursor coupled to a page. Used by the pager before
/// eviction, by erase before slots shift, and by transaction rollback.
pub(crate) fn uncouple_all(state: &mut DbState, page_id: PageId) -> Result<()> {
    let ids = match state.pager.cached_mut(page_id) {
        Ok(page) => std::mem::take(&mut page.cursors),
        Err(_) => return Ok(()),
    };
    for (i, &cid) in ids.iter().enumerate() {
        if let Err(err) = uncouple(state, cid, true) {
            // keep the not-yet-visited cursors registered
            if let Ok(page) = state.pager.cached_mut(page_id) {
                page.cursors.extend_from_slice(&ids[i..]);
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Re-couple an uncoupled cursor by looking up its owned key.
pub(crate) fn couple_by_key(state: &mut DbState, cid: CursorId) -> Result<()> {
    let key = match state.cursors.pos(cid)? {
        CursorPos::Uncoupled { key } => key.clone(),
        _ => {
            return Err(Error::with_message(
                ErrorCode::Internal,
                "coupling a cursor which is not uncoupled",
            ))
        }
    };
    cursor_find(state, cid, &key)
}

/// Exact-match find: on success the cursor is coupled to the slot, on a
/// miss it stays NIL.
pub(crate) fn cursor_find(state: &mut DbState, cid: CursorId, key: &[u8]) -> Result<()> {
    btree::validate_key(state, key)?;
    set_to_nil(state, cid)?;
    match btree::find_slot(state, key)? {
        Some((leaf, index)) => couple_to(state, cid, leaf, index),
        None => Err(Error::new(ErrorCode::KeyNotFound)),
    }
}

// ============================================================================
// List reconciliation for structural modifications
// ============================================================================

/// A slot was opened at `index`: coupled cursors at or past it move right.
pub(crate) fn adjust_for_insert(
    state: &mut DbState,
    page_id: PageId,
    at: u16,
) -> Result<()> {
    let ids = match state.pager.cached(page_id) {
        Ok(page) => page.cursors.clone(),
        Err(_) => return Ok(()),
    };
    for cid in ids {
        if let CursorPos::Coupled { index, .. } = state.cursors.pos_mut(cid)? {
            if *index >= at {
                *index += 1;
            }
        }
    }
    Ok(())
}

/// A leaf split moved slots `[pivot, count)` to a new sibling: cursors on
/// those slots re-couple to the sibling at their shifted index.
pub(crate) fn adjust_for_split(
    state: &mut DbState,
    old_id: PageId,
    new_id: PageId,
    pivot: u16,
) -> Result<()> {
    let ids = state.pager.cached(old_id)?.cursors.clone();
    for cid in ids {
        let moved = match state.cursors.pos(cid)? {
            CursorPos::Coupled { index, .. } => *index >= pivot,
            _ => false,
        };
        if !moved {
            continue;
        }
        state.pager.cached_mut(old_id)?.cursors.retain(|&c| c != cid);
        state.pager.cached_mut(new_id)?.cursors.push(cid);
        if let CursorPos::Coupled { page, index, .. } = state.cursors.pos_mut(cid)? {
            *page = new_id;
            *index -= pivot;
        }
    }
    Ok(())
}

/// Verify invariants 4 and 5: coupled cursors point at valid leaf slots and
/// appear exactly once in their page's cursor list and nowhere else.
pub(crate) fn check_cursors(state: &mut DbState) -> Result<()> {
    for cid in state.cursors.ids() {
        if let CursorPos::Coupled { page, index, dupe_id } = state.cursors.pos(cid)? {
            let (page, index, dupe_id) = (*page, *index, *dupe_id);
            if dupe_id != 0 {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("cursor {}: dupe_id must stay zero", cid),
                ));
            }
            let node = state.pager.cached(page)?;
            if !node::is_leaf(node) || index >= node::count(node) {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("cursor {}: coupled outside a valid leaf slot", cid),
                ));
            }
            if node.cursors.iter().filter(|&&c| c == cid).count() != 1 {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("cursor {}: not registered exactly once on page {}", cid, page),
                ));
            }
        }
    }
    for page_id in state.pager.cached_ids() {
        let ids = state.pager.cached(page_id)?.cursors.clone();
        for cid in ids {
            match state.cursors.pos(cid)? {
                CursorPos::Coupled { page, .. } if *page == page_id => {}
                _ => {
                    return Err(Error::with_message(
                        ErrorCode::Internal,
                        format!("page {}: stale cursor list entry {}", page_id, cid),
                    ))
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Directional movement
// ============================================================================

fn move_first(state: &mut DbState, cid: CursorId) -> Result<()> {
    set_to_nil(state, cid)?;
    let mut page_id = state.root_page;
    loop {
        let (count, is_leaf, ptr_left) = {
            let page = state.fetch_page(page_id)?;
            (node::count(page), node::is_leaf(page), node::ptr_left(page))
        };
        if is_leaf {
            break;
        }
        if count == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        page_id = ptr_left;
    }
    // skip leaves emptied by erase
    loop {
        let (count, right) = {
            let page = state.fetch_page(page_id)?;
            (node::count(page), node::right(page))
        };
        if count > 0 {
            break;
        }
        if right == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        page_id = right;
    }
    couple_to(state, cid, page_id, 0)
}

fn move_last(state: &mut DbState, cid: CursorId) -> Result<()> {
    set_to_nil(state, cid)?;
    let ks = state.key_size;
    let mut page_id = state.root_page;
    loop {
        let (count, is_leaf, last_child) = {
            let page = state.fetch_page(page_id)?;
            let count = node::count(page);
            let child = if !node::is_leaf(page) && count > 0 {
                node::slot_ptr(page, ks, count - 1)
            } else {
                0
            };
            (count, node::is_leaf(page), child)
        };
        if is_leaf {
            break;
        }
        if count == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        page_id = last_child;
    }
    loop {
        let (count, left) = {
            let page = state.fetch_page(page_id)?;
            (node::count(page), node::left(page))
        };
        if count > 0 {
            return couple_to(state, cid, page_id, count - 1);
        }
        if left == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        page_id = left;
    }
}

fn move_next(state: &mut DbState, cid: CursorId) -> Result<()> {
    match state.cursors.pos(cid)? {
        CursorPos::Uncoupled { .. } => couple_by_key(state, cid)?,
        CursorPos::Nil => return Err(Error::new(ErrorCode::CursorIsNil)),
        CursorPos::Coupled { .. } => {}
    }
    let (page_id, index) = coupled_at(state, cid)?;
    let count = node::count(state.fetch_page(page_id)?);

    // still inside the coupled page: advance in place
    if index + 1 < count {
        if let CursorPos::Coupled { index, .. } = state.cursors.pos_mut(cid)? {
            *index += 1;
        }
        return Ok(());
    }

    // otherwise the next non-empty right sibling holds the next key
    let mut sib = node::right(state.fetch_page(page_id)?);
    while sib != 0 && node::count(state.fetch_page(sib)?) == 0 {
        sib = node::right(state.fetch_page(sib)?);
    }
    if sib == 0 {
        return Err(Error::new(ErrorCode::KeyNotFound));
    }
    set_to_nil(state, cid)?;
    couple_to(state, cid, sib, 0)
}

fn move_previous(state: &mut DbState, cid: CursorId) -> Result<()> {
    match state.cursors.pos(cid)? {
        CursorPos::Uncoupled { .. } => couple_by_key(state, cid)?,
        CursorPos::Nil => return Err(Error::new(ErrorCode::CursorIsNil)),
        CursorPos::Coupled { .. } => {}
    }
    let (page_id, index) = coupled_at(state, cid)?;

    if index > 0 {
        if let CursorPos::Coupled { index, .. } = state.cursors.pos_mut(cid)? {
            *index -= 1;
        }
        return Ok(());
    }

    let mut sib = node::left(state.fetch_page(page_id)?);
    while sib != 0 && node::count(state.fetch_page(sib)?) == 0 {
        sib = node::left(state.fetch_page(sib)?);
    }
    if sib == 0 {
        return Err(Error::new(ErrorCode::KeyNotFound));
    }
    let last = node::count(state.fetch_page(sib)?) - 1;
    set_to_nil(state, cid)?;
    couple_to(state, cid, sib, last)
}

fn coupled_at(state: &DbState, cid: CursorId) -> Result<(PageId, u16)> {
    match state.cursors.pos(cid)? {
        CursorPos::Coupled { page, index, .. } => Ok((*page, *index)),
        _ => Err(Error::with_message(
            ErrorCode::Internal,
            "cursor is not coupled",
        )),
    }
}

// ============================================================================
// Public cursor handle
// ============================================================================

/// Stateful iterator over a database, owned by the caller.
pub struct Cursor {
    db: Weak<RwLock<DbState>>,
    id: CursorId,
}

impl Cursor {
    pub(crate) fn new(db: Weak<RwLock<DbState>>, id: CursorId) -> Self {
        Cursor { db, id }
    }

    fn backend(&self) -> Result<Arc<RwLock<DbState>>> {
        self.db
            .upgrade()
            .ok_or(Error::new(ErrorCode::NotInitialized))
    }

    /// True when the cursor has no position (or its database is gone).
    pub fn is_nil(&self) -> bool {
        match self.db.upgrade() {
            Some(arc) => match arc.read() {
                Ok(state) => matches!(state.cursors.pos(self.id), Ok(CursorPos::Nil)),
                Err(_) => true,
            },
            None => true,
        }
    }

    /// Position the cursor on an exact key match. On a miss the cursor is
    /// NIL and `KeyNotFound` is returned.
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        with_local_txn(state, |state| cursor_find(state, cid, key))
    }

    /// Insert a key/record pair and couple the cursor to the new slot.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        with_local_txn(state, |state| {
            set_to_nil(state, cid)?;
            btree::insert(state, Some(cid), key, record, flags)
        })
    }

    /// Erase the key under the cursor; the cursor ends up NIL.
    pub fn erase(&mut self) -> Result<()> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        with_local_txn(state, |state| {
            match state.cursors.pos(cid)? {
                CursorPos::Coupled { .. } => uncouple(state, cid, false)?,
                CursorPos::Nil => return Err(Error::new(ErrorCode::CursorIsNil)),
                CursorPos::Uncoupled { .. } => {}
            }
            let key = match state.cursors.pos(cid)? {
                CursorPos::Uncoupled { key } => key.clone(),
                _ => return Err(Error::new(ErrorCode::Internal)),
            };
            btree::erase(state, &key)?;
            set_to_nil(state, cid)
        })
    }

    /// Replace the record under the cursor, leaving the key untouched.
    pub fn overwrite(&mut self, record: &[u8]) -> Result<()> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        with_local_txn(state, |state| {
            match state.cursors.pos(cid)? {
                CursorPos::Uncoupled { .. } => couple_by_key(state, cid)?,
                CursorPos::Nil => return Err(Error::new(ErrorCode::CursorIsNil)),
                CursorPos::Coupled { .. } => {}
            }
            let (page_id, index) = coupled_at(state, cid)?;
            btree::with_pinned(state, page_id, |state| {
                btree::replace_record(state, page_id, index, record)
            })
        })
    }

    /// Move the cursor and read out what `fetch` asks for.
    ///
    /// A NIL cursor is seeded: NEXT behaves as FIRST and PREVIOUS as LAST.
    /// Without a direction the cursor reads in place; that is `CursorIsNil`
    /// on a NIL cursor when a key or record was requested, and a plain OK
    /// otherwise.
    pub fn move_to(
        &mut self,
        direction: Option<Direction>,
        fetch: Fetch,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        with_local_txn(state, |state| {
            let nil = matches!(state.cursors.pos(cid)?, CursorPos::Nil);
            let direction = match (direction, nil) {
                (Some(Direction::Next), true) => Some(Direction::First),
                (Some(Direction::Previous), true) => Some(Direction::Last),
                (d, _) => d,
            };
            match direction {
                Some(Direction::First) => move_first(state, cid)?,
                Some(Direction::Last) => move_last(state, cid)?,
                Some(Direction::Next) => move_next(state, cid)?,
                Some(Direction::Previous) => move_previous(state, cid)?,
                None => {
                    if nil {
                        if fetch.is_empty() {
                            return Ok((None, None));
                        }
                        return Err(Error::new(ErrorCode::CursorIsNil));
                    }
                    if matches!(state.cursors.pos(cid)?, CursorPos::Uncoupled { .. }) {
                        couple_by_key(state, cid)?;
                    }
                }
            }

            // Reading the key or record can fetch blob pages; pin the
            // coupled page so those fetches cannot evict it.
            let (page_id, index) = coupled_at(state, cid)?;
            btree::with_pinned(state, page_id, |state| {
                let key = if fetch.contains(Fetch::KEY) {
                    Some(btree::read_key(state, page_id, index)?)
                } else {
                    None
                };
                let record = if fetch.contains(Fetch::RECORD) {
                    Some(btree::read_record(state, page_id, index)?)
                } else {
                    None
                };
                Ok((key, record))
            })
        })
    }

    /// Seed on the smallest key and return it with its record.
    pub fn first(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.step(Direction::First)
    }

    /// Seed on the largest key and return it with its record.
    pub fn last(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.step(Direction::Last)
    }

    /// Advance to the next key in comparator order.
    pub fn next(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.step(Direction::Next)
    }

    /// Step back to the previous key in comparator order.
    pub fn previous(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.step(Direction::Previous)
    }

    fn step(&mut self, direction: Direction) -> Result<(Vec<u8>, Vec<u8>)> {
        let (key, record) = self.move_to(Some(direction), Fetch::KEY | Fetch::RECORD)?;
        match (key, record) {
            (Some(key), Some(record)) => Ok((key, record)),
            _ => Err(Error::new(ErrorCode::Internal)),
        }
    }

    /// Clone this cursor's mode into a new cursor at the head of the
    /// database's cursor list.
    pub fn try_clone(&self) -> Result<Cursor> {
        let arc = self.backend()?;
        let mut guard = arc.write().map_err(|_| Error::new(ErrorCode::Internal))?;
        let state = &mut *guard;
        let cid = self.id;
        let new_id = with_local_txn(state, |state| {
            let new_id = state.cursors.create();
            match state.cursors.pos(cid)? {
                CursorPos::Coupled { page, index, dupe_id } => {
                    let (page, index, dupe_id) = (*page, *index, *dupe_id);
                    state.pager.cached_mut(page)?.cursors.push(new_id);
                    *state.cursors.pos_mut(new_id)? = CursorPos::Coupled {
                        page,
                        index,
                        dupe_id,
                    };
                }
                CursorPos::Uncoupled { key } => {
                    let key = key.clone();
                    state.tracker.allocate(key.len())?;
                    *state.cursors.pos_mut(new_id)? = CursorPos::Uncoupled { key };
                }
                CursorPos::Nil => {}
            }
            Ok(new_id)
        })?;
        Ok(Cursor {
            db: self.db.clone(),
            id: new_id,
        })
    }

    /// Detach the cursor from the database and free its resources. Dropping
    /// the cursor does the same.
    pub fn close(self) {}
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(arc) = self.db.upgrade() {
            if let Ok(mut state) = arc.write() {
                let _ = set_to_nil(&mut state, self.id);
                state.cursors.remove(self.id);
            }
        }
    }
}
