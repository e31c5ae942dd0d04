//! Database handle
//!
//! `Database` owns the shared state behind an `Arc<RwLock<..>>`; cursors hold
//! a weak reference to the same state. All public operations are framed by
//! the local-transaction wrapper: when the caller has not begun an outer
//! transaction, a private one scopes the operation and commits on success or
//! aborts on any failure.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use log::debug;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::MemTracker;
use crate::storage::btree::cursor::{self, Cursor, CursorTable};
use crate::storage::btree::types::InsertFlags;
use crate::storage::btree::{self, node};
use crate::storage::extkey::ExtKeyCache;
use crate::storage::pager::{Page, PageKind, Pager};
use crate::txn::{PageImage, Txn, TxnState};
use crate::types::{Config, KeyComparator, PageId, MIN_PAGE_SIZE};

const MAGIC: [u8; 4] = *b"RKVS";
const FORMAT_VERSION: u16 = 1;

// Header page field offsets; byte 0 is the page type tag
const HDR_MAGIC: usize = 1;
const HDR_VERSION: usize = 6;
const HDR_PAGE_SIZE: usize = 8;
const HDR_KEY_SIZE: usize = 12;
const HDR_MAX_KEYS: usize = 14;
const HDR_ROOT: usize = 16;

pub(crate) struct DbState {
    pub(crate) pager: Pager,
    pub(crate) extkeys: ExtKeyCache,
    pub(crate) txns: TxnState,
    pub(crate) comparator: KeyComparator,
    pub(crate) cursors: CursorTable,
    pub(crate) tracker: Arc<MemTracker>,
    pub(crate) key_size: u16,
    pub(crate) max_keys: u16,
    pub(crate) root_page: PageId,
}

impl DbState {
    pub(crate) fn page_size(&self) -> u32 {
        self.pager.page_size()
    }

    /// Fetch a page for reading, evicting other pages first when the cache
    /// is over budget.
    pub(crate) fn fetch_page(&mut self, id: PageId) -> Result<&Page> {
        if !self.pager.is_cached(id) {
            self.purge_cache()?;
        }
        Ok(self.pager.fetch(id)?)
    }

    /// Fetch a page for mutation: journals its pre-image under an active
    /// transaction and marks it dirty.
    pub(crate) fn page_for_write(&mut self, id: PageId) -> Result<&mut Page> {
        if self.txns.is_active() && !self.txns.journaled(id) {
            let image = {
                let page = self.fetch_page(id)?;
                PageImage::Existed {
                    kind: page.kind,
                    data: page.data.clone(),
                }
            };
            self.txns.record(id, image);
        } else {
            let _ = self.fetch_page(id)?;
        }
        let page = self.pager.cached_mut(id)?;
        page.dirty = true;
        Ok(page)
    }

    pub(crate) fn alloc_page(&mut self, kind: PageKind) -> Result<PageId> {
        self.purge_cache()?;
        let id = self.pager.alloc(kind)?;
        self.txns.record(id, PageImage::Absent);
        Ok(id)
    }

    pub(crate) fn free_page(&mut self, id: PageId) -> Result<()> {
        if self.txns.is_active() && !self.txns.journaled(id) {
            let image = {
                let page = self.fetch_page(id)?;
                PageImage::Existed {
                    kind: page.kind,
                    data: page.data.clone(),
                }
            };
            self.txns.record(id, image);
        }
        self.pager.free(id)
    }

    pub(crate) fn flush_page(&mut self, id: PageId) -> Result<()> {
        self.pager.flush_page(id)
    }

    /// Point the database at a new root page and persist the id in the
    /// header page.
    pub(crate) fn set_root(&mut self, id: PageId) -> Result<()> {
        let page = self.page_for_write(0)?;
        page.data[HDR_ROOT..HDR_ROOT + 8].copy_from_slice(&id.to_le_bytes());
        self.root_page = id;
        Ok(())
    }

    /// Evict unpinned pages until the cache is back under budget, forcing
    /// their coupled cursors to uncouple first.
    pub(crate) fn purge_cache(&mut self) -> Result<()> {
        if self.pager.is_in_memory() || !self.pager.over_capacity() {
            return Ok(());
        }
        let mut ids = self.pager.cached_ids();
        ids.sort_unstable();
        for id in ids {
            if !self.pager.over_capacity() {
                break;
            }
            if id == 0 || id == self.root_page {
                continue;
            }
            if self.pager.cached(id)?.is_pinned() {
                continue;
            }
            cursor::uncouple_all(self, id)?;
            self.pager.evict(id)?;
        }
        Ok(())
    }

    fn commit_inner(&mut self, txn: &Txn) -> Result<()> {
        self.txns.commit(txn)?;
        self.pager.flush_all()
    }

    fn abort_inner(&mut self, txn: &Txn) -> Result<()> {
        let (journal, root, freelist) = self.txns.abort(txn)?;
        // Cursors keep the keys they saw before the rollback.
        for &id in journal.keys() {
            if self.pager.is_cached(id) {
                cursor::uncouple_all(self, id)?;
            }
        }
        for (id, image) in journal {
            match image {
                PageImage::Existed { kind, data } => self.pager.restore(id, kind, data)?,
                PageImage::Absent => self.pager.discard(id),
            }
        }
        self.root_page = root;
        self.pager.set_freelist(freelist);
        self.extkeys.clear();
        Ok(())
    }
}

impl Drop for DbState {
    fn drop(&mut self) {
        self.cursors.release_buffers(&self.tracker);
    }
}

/// Run `op` under the caller's outer transaction when one is active,
/// otherwise under a private transaction that commits on success and aborts
/// on any failure.
pub(crate) fn with_local_txn<T>(
    state: &mut DbState,
    op: impl FnOnce(&mut DbState) -> Result<T>,
) -> Result<T> {
    if state.txns.is_active() {
        return op(state);
    }
    let txn = state.txns.begin(state.root_page, state.pager.freelist())?;
    match op(state) {
        Ok(value) => {
            state.commit_inner(&txn)?;
            Ok(value)
        }
        Err(err) => {
            let _ = state.abort_inner(&txn);
            Err(err)
        }
    }
}

/// An embedded key/value database: a B+-tree over a pager, addressed by a
/// file path or held as an anonymous in-memory image.
pub struct Database {
    state: Arc<RwLock<DbState>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database. `None` creates an anonymous in-memory image;
    /// `Some(path)` creates (and truncates) a database file.
    pub fn create(path: Option<&Path>, config: Config) -> Result<Database> {
        config.validate()?;
        let tracker = config
            .tracker
            .clone()
            .unwrap_or_else(|| Arc::new(MemTracker::new()));
        let pager = match path {
            Some(path) => Pager::create_file(
                path,
                config.page_size,
                config.cache_capacity,
                tracker.clone(),
            )?,
            None => Pager::in_memory(config.page_size, tracker.clone()),
        };
        let max_keys = node::max_keys(config.page_size, config.key_size);
        let mut state = DbState {
            pager,
            extkeys: ExtKeyCache::new(),
            txns: TxnState::new(),
            comparator: config.comparator,
            cursors: CursorTable::new(),
            tracker,
            key_size: config.key_size,
            max_keys,
            root_page: 0,
        };

        let header = state.alloc_page(PageKind::Header)?;
        debug_assert_eq!(header, 0);
        let root = state.alloc_page(PageKind::Root)?;
        {
            let page = state.pager.cached_mut(root)?;
            node::init(page, true);
        }
        {
            let page = state.pager.cached_mut(header)?;
            page.data[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(&MAGIC);
            page.data[HDR_VERSION..HDR_VERSION + 2]
                .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            page.data[HDR_PAGE_SIZE..HDR_PAGE_SIZE + 4]
                .copy_from_slice(&config.page_size.to_le_bytes());
            page.data[HDR_KEY_SIZE..HDR_KEY_SIZE + 2]
                .copy_from_slice(&config.key_size.to_le_bytes());
            page.data[HDR_MAX_KEYS..HDR_MAX_KEYS + 2]
                .copy_from_slice(&max_keys.to_le_bytes());
            page.data[HDR_ROOT..HDR_ROOT + 8].copy_from_slice(&root.to_le_bytes());
        }
        state.root_page = root;
        state.pager.flush_all()?;
        debug!(
            "created database ({} mode, page_size={}, key_size={}, max_keys={})",
            if path.is_some() { "file" } else { "memory" },
            config.page_size,
            config.key_size,
            max_keys
        );
        Ok(Database {
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Open an existing database file. Page and key sizes are taken from the
    /// file header; cache, comparator, and tracker come from `config`.
    pub fn open(path: &Path, config: Config) -> Result<Database> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = vec![0u8; MIN_PAGE_SIZE as usize];
        file.read_exact(&mut header)?;

        if header[0] != PageKind::Header.tag() || header[HDR_MAGIC..HDR_MAGIC + 4] != MAGIC {
            return Err(Error::with_message(
                ErrorCode::InvFileVersion,
                "not a rustkv database file",
            ));
        }
        let version = u16::from_le_bytes([header[HDR_VERSION], header[HDR_VERSION + 1]]);
        if version != FORMAT_VERSION {
            return Err(Error::with_message(
                ErrorCode::InvFileVersion,
                format!("format version {} is not supported", version),
            ));
        }
        let page_size = u32::from_le_bytes(
            header[HDR_PAGE_SIZE..HDR_PAGE_SIZE + 4]
                .try_into()
                .unwrap_or([0; 4]),
        );
        if !(MIN_PAGE_SIZE..=crate::types::MAX_PAGE_SIZE).contains(&page_size)
            || !page_size.is_power_of_two()
        {
            return Err(Error::with_message(
                ErrorCode::InvPagesize,
                format!("header declares page size {}", page_size),
            ));
        }
        let key_size = u16::from_le_bytes([header[HDR_KEY_SIZE], header[HDR_KEY_SIZE + 1]]);
        let max_keys = u16::from_le_bytes([header[HDR_MAX_KEYS], header[HDR_MAX_KEYS + 1]]);
        let root_page = u64::from_le_bytes(
            header[HDR_ROOT..HDR_ROOT + 8].try_into().unwrap_or([0; 8]),
        );
        if key_size == 0 || max_keys < 2 || root_page == 0 {
            return Err(Error::with_message(
                ErrorCode::InvFileVersion,
                "corrupt database header",
            ));
        }

        let tracker = config
            .tracker
            .clone()
            .unwrap_or_else(|| Arc::new(MemTracker::new()));
        let pager = Pager::open_file(file, page_size, config.cache_capacity, tracker.clone())?;
        let state = DbState {
            pager,
            extkeys: ExtKeyCache::new(),
            txns: TxnState::new(),
            comparator: config.comparator,
            cursors: CursorTable::new(),
            tracker,
            key_size,
            max_keys,
            root_page,
        };
        debug!(
            "opened database (page_size={}, key_size={}, root={})",
            page_size, key_size, root_page
        );
        Ok(Database {
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn lock(&self) -> Result<RwLockWriteGuard<'_, DbState>> {
        self.state
            .write()
            .map_err(|_| Error::new(ErrorCode::Internal))
    }

    /// Write all dirty pages back to the file and sync it.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.pager.flush_all()?;
        state.pager.sync()
    }

    /// Flush and close the database. Outstanding cursors become inert: their
    /// operations fail with `NotInitialized`.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        debug!("closing database");
        Ok(())
    }

    /// Insert a key/record pair. Duplicate keys fail with `DuplicateKey`
    /// unless `OVERWRITE` is set, in which case the existing record is
    /// replaced in place.
    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        with_local_txn(state, |state| btree::insert(state, None, key, record, flags))
    }

    /// Exact-match lookup returning the record bytes.
    pub fn find(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        with_local_txn(state, |state| btree::lookup(state, key))
    }

    /// Remove a key and its record.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        with_local_txn(state, |state| btree::erase(state, key))
    }

    /// Create a cursor over this database, positioned at NIL.
    pub fn cursor(&self) -> Result<Cursor> {
        let mut state = self.lock()?;
        let id = state.cursors.create();
        Ok(Cursor::new(Arc::downgrade(&self.state), id))
    }

    /// Begin an outer transaction spanning subsequent operations.
    pub fn txn_begin(&self) -> Result<Txn> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let freelist = state.pager.freelist();
        state.txns.begin(state.root_page, freelist)
    }

    pub fn txn_commit(&self, txn: Txn) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.commit_inner(&txn)
    }

    pub fn txn_abort(&self, txn: Txn) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.abort_inner(&txn)
    }

    /// Page id of the current tree root.
    pub fn root_page(&self) -> Result<PageId> {
        Ok(self.lock()?.root_page)
    }

    /// Number of levels from the root down to the leaves.
    pub fn tree_depth(&self) -> Result<usize> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        btree::tree_depth(state)
    }

    /// Verify the structural invariants of the tree and of every cursor.
    pub fn check_integrity(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        btree::check_integrity(state)
    }
}

#[cfg(test)]
impl Database {
    /// Test hook: run a closure against the locked database state.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut DbState) -> T) -> T {
        let mut guard = self.state.write().expect("state lock poisoned");
        f(&mut guard)
    }
}
