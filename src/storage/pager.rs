//! Page cache management
//!
//! The pager maps page ids to in-memory page buffers and handles allocation,
//! eviction, and file I/O. A page id is the byte offset of the page in the
//! database file; anonymous in-memory images use the same id scheme without a
//! backing file. Page 0 is the database header page.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::MemTracker;
use crate::types::{CursorId, PageId};

/// Page type tag, persisted as byte 0 of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    /// Database header (page 0)
    Header = 1,
    /// B+-tree root page
    Root = 2,
    /// Internal B+-tree page
    Index = 3,
    /// B+-tree leaf page
    Leaf = 4,
    /// Blob chain page
    Blob = 5,
}

impl PageKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(PageKind::Header),
            2 => Ok(PageKind::Root),
            3 => Ok(PageKind::Index),
            4 => Ok(PageKind::Leaf),
            5 => Ok(PageKind::Blob),
            _ => Err(Error::with_message(
                ErrorCode::Internal,
                format!("unknown page tag {}", tag),
            )),
        }
    }
}

/// A cached page buffer.
///
/// The cursor list carries the ids of every cursor currently coupled to this
/// page; any structural modification or eviction of the page must reconcile
/// that list first.
pub struct Page {
    pub id: PageId,
    pub kind: PageKind,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub pin: u32,
    pub cursors: Vec<CursorId>,
}

impl Page {
    fn new(id: PageId, kind: PageKind, page_size: u32) -> Self {
        let mut data = vec![0u8; page_size as usize];
        data[0] = kind.tag();
        Page {
            id,
            kind,
            data,
            dirty: false,
            pin: 0,
            cursors: Vec::new(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin > 0
    }
}

pub struct Pager {
    file: Option<File>,
    page_size: u32,
    pages: HashMap<PageId, Page>,
    /// Offset one past the highest page ever allocated
    end_offset: PageId,
    /// Reusable page ids; kept in memory only
    freelist: Vec<PageId>,
    cache_capacity: usize,
    tracker: Arc<MemTracker>,
}

impl Pager {
    /// Pager for an anonymous in-memory image. Nothing is ever evicted.
    pub fn in_memory(page_size: u32, tracker: Arc<MemTracker>) -> Self {
        Pager {
            file: None,
            page_size,
            pages: HashMap::new(),
            end_offset: 0,
            freelist: Vec::new(),
            cache_capacity: usize::MAX,
            tracker,
        }
    }

    /// Pager over a freshly created (truncated) database file.
    pub fn create_file(
        path: &Path,
        page_size: u32,
        cache_capacity: usize,
        tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Pager {
            file: Some(file),
            page_size,
            pages: HashMap::new(),
            end_offset: 0,
            freelist: Vec::new(),
            cache_capacity: cache_capacity.max(8),
            tracker,
        })
    }

    /// Pager over an existing database file whose header has already been
    /// parsed by the caller.
    pub fn open_file(
        file: File,
        page_size: u32,
        cache_capacity: usize,
        tracker: Arc<MemTracker>,
    ) -> Result<Self> {
        let len = file.metadata()?.len();
        let end_offset = len - (len % page_size as u64);
        Ok(Pager {
            file: Some(file),
            page_size,
            pages: HashMap::new(),
            end_offset,
            freelist: Vec::new(),
            cache_capacity: cache_capacity.max(8),
            tracker,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_in_memory(&self) -> bool {
        self.file.is_none()
    }

    pub fn cached_len(&self) -> usize {
        self.pages.len()
    }

    pub fn over_capacity(&self) -> bool {
        self.pages.len() > self.cache_capacity
    }

    pub fn cached_ids(&self) -> Vec<PageId> {
        self.pages.keys().copied().collect()
    }

    pub fn is_cached(&self, id: PageId) -> bool {
        self.pages.contains_key(&id)
    }

    /// Fetch a page, reading it from the file when it is not resident.
    pub fn fetch(&mut self, id: PageId) -> Result<&mut Page> {
        if !self.pages.contains_key(&id) {
            let page = self.read_page(id)?;
            self.tracker.allocate(self.page_size as usize)?;
            self.pages.insert(id, page);
        }
        Ok(self.pages.get_mut(&id).ok_or(Error::new(ErrorCode::Internal))?)
    }

    /// Borrow a page that is known to be resident.
    pub fn cached(&self, id: PageId) -> Result<&Page> {
        self.pages
            .get(&id)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("page {} not cached", id)))
    }

    pub fn cached_mut(&mut self, id: PageId) -> Result<&mut Page> {
        self.pages
            .get_mut(&id)
            .ok_or_else(|| Error::with_message(ErrorCode::Internal, format!("page {} not cached", id)))
    }

    /// Allocate a zeroed page of the given kind and return its id.
    pub fn alloc(&mut self, kind: PageKind) -> Result<PageId> {
        self.tracker.allocate(self.page_size as usize)?;
        let id = match self.freelist.pop() {
            Some(id) => id,
            None => {
                let id = self.end_offset;
                self.end_offset += self.page_size as u64;
                id
            }
        };
        let mut page = Page::new(id, kind, self.page_size);
        page.dirty = true;
        self.pages.insert(id, page);
        trace!("alloc page {} kind {:?}", id, kind);
        Ok(id)
    }

    /// Return a page to the free list. The caller must have reconciled the
    /// page's cursor list beforehand.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        if let Some(page) = self.pages.remove(&id) {
            if page.is_pinned() || !page.cursors.is_empty() {
                self.pages.insert(id, page);
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("freeing page {} which is still in use", id),
                ));
            }
            self.tracker.release(self.page_size as usize);
        }
        self.freelist.push(id);
        trace!("free page {}", id);
        Ok(())
    }

    pub fn pin(&mut self, id: PageId) -> Result<()> {
        let page = self.cached_mut(id)?;
        page.pin += 1;
        Ok(())
    }

    pub fn unpin(&mut self, id: PageId) {
        if let Some(page) = self.pages.get_mut(&id) {
            debug_assert!(page.pin > 0);
            page.pin = page.pin.saturating_sub(1);
        }
    }

    pub fn mark_dirty(&mut self, id: PageId) -> Result<()> {
        self.cached_mut(id)?.dirty = true;
        Ok(())
    }

    /// Write a single page back to the file if it is dirty. No-op for
    /// in-memory images.
    pub fn flush_page(&mut self, id: PageId) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let dirty = match self.pages.get(&id) {
            Some(page) => page.dirty,
            None => return Ok(()),
        };
        if dirty {
            self.write_page(id)?;
            self.cached_mut(id)?.dirty = false;
        }
        Ok(())
    }

    /// Write every dirty page back to the file.
    pub fn flush_all(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let dirty: Vec<PageId> = self
            .pages
            .values()
            .filter(|p| p.dirty)
            .map(|p| p.id)
            .collect();
        for id in dirty {
            self.write_page(id)?;
            self.cached_mut(id)?.dirty = false;
        }
        Ok(())
    }

    /// Sync the file to stable storage. No-op for in-memory images.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Drop a resident page, flushing it first when dirty. The caller must
    /// have uncoupled every cursor on the page.
    pub fn evict(&mut self, id: PageId) -> Result<()> {
        let page = self.cached(id)?;
        if page.is_pinned() || !page.cursors.is_empty() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("evicting page {} which is still in use", id),
            ));
        }
        self.flush_page(id)?;
        self.pages.remove(&id);
        self.tracker.release(self.page_size as usize);
        trace!("evict page {}", id);
        Ok(())
    }

    /// Drop a resident page without flushing or touching the free list.
    /// Used when aborting a transaction that allocated the page.
    pub fn discard(&mut self, id: PageId) {
        if self.pages.remove(&id).is_some() {
            self.tracker.release(self.page_size as usize);
        }
    }

    /// Reinstate a page from a journaled pre-image.
    pub fn restore(&mut self, id: PageId, kind: PageKind, data: Vec<u8>) -> Result<()> {
        if let Some(page) = self.pages.get_mut(&id) {
            page.kind = kind;
            page.data = data;
            page.dirty = true;
            return Ok(());
        }
        self.tracker.allocate(self.page_size as usize)?;
        self.pages.insert(
            id,
            Page {
                id,
                kind,
                data,
                dirty: true,
                pin: 0,
                cursors: Vec::new(),
            },
        );
        Ok(())
    }

    /// Overwrite the in-memory free list (transaction rollback).
    pub fn set_freelist(&mut self, freelist: Vec<PageId>) {
        self.freelist = freelist;
    }

    pub fn freelist(&self) -> Vec<PageId> {
        self.freelist.clone()
    }

    fn read_page(&mut self, id: PageId) -> Result<Page> {
        let page_size = self.page_size;
        let file = self.file.as_mut().ok_or_else(|| {
            Error::with_message(
                ErrorCode::Internal,
                format!("page {} is not resident in an in-memory image", id),
            )
        })?;
        if id >= self.end_offset {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} is beyond the end of the file", id),
            ));
        }
        let mut data = vec![0u8; page_size as usize];
        file.seek(SeekFrom::Start(id))?;
        file.read_exact(&mut data)?;
        let kind = PageKind::from_tag(data[0])?;
        Ok(Page {
            id,
            kind,
            data,
            dirty: false,
            pin: 0,
            cursors: Vec::new(),
        })
    }

    fn write_page(&mut self, id: PageId) -> Result<()> {
        let page = self
            .pages
            .get(&id)
            .ok_or(Error::new(ErrorCode::Internal))?;
        let data = page.data.clone();
        let file = self.file.as_mut().ok_or(Error::new(ErrorCode::Internal))?;
        file.seek(SeekFrom::Start(id))?;
        file.write_all(&data)?;
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let resident = self.pages.len();
        self.tracker
            .release(resident * self.page_size as usize);
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pager() -> Pager {
        Pager::in_memory(512, Arc::new(MemTracker::new()))
    }

    #[test]
    fn alloc_assigns_sequential_offsets() {
        let mut pager = memory_pager();
        let a = pager.alloc(PageKind::Leaf).unwrap();
        let b = pager.alloc(PageKind::Leaf).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 512);
        assert_eq!(pager.fetch(b).unwrap().kind, PageKind::Leaf);
    }

    #[test]
    fn freed_pages_are_reused() {
        let mut pager = memory_pager();
        let a = pager.alloc(PageKind::Blob).unwrap();
        let _b = pager.alloc(PageKind::Blob).unwrap();
        pager.free(a).unwrap();
        let c = pager.alloc(PageKind::Leaf).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn pinned_pages_cannot_be_evicted() {
        let mut pager = memory_pager();
        let a = pager.alloc(PageKind::Leaf).unwrap();
        pager.pin(a).unwrap();
        assert!(pager.evict(a).is_err());
        pager.unpin(a);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let tracker = Arc::new(MemTracker::new());
        let id;
        {
            let mut pager = Pager::create_file(&path, 512, 8, tracker.clone()).unwrap();
            id = pager.alloc(PageKind::Leaf).unwrap();
            pager.cached_mut(id).unwrap().data[100] = 0xAB;
            pager.mark_dirty(id).unwrap();
            pager.flush_all().unwrap();
        }
        assert_eq!(tracker.live(), 0);
        let file = File::open(&path).unwrap();
        let mut pager = Pager::open_file(file, 512, 8, tracker.clone()).unwrap();
        let page = pager.fetch(id).unwrap();
        assert_eq!(page.kind, PageKind::Leaf);
        assert_eq!(page.data[100], 0xAB);
    }

    #[test]
    fn evict_flushes_and_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evict.db");
        let tracker = Arc::new(MemTracker::new());
        let mut pager = Pager::create_file(&path, 512, 8, tracker).unwrap();
        let id = pager.alloc(PageKind::Blob).unwrap();
        pager.cached_mut(id).unwrap().data[8] = 7;
        pager.mark_dirty(id).unwrap();
        pager.evict(id).unwrap();
        assert_eq!(pager.cached_len(), 0);
        assert_eq!(pager.fetch(id).unwrap().data[8], 7);
    }

    #[test]
    fn open_file_requires_write_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.db");
        {
            let mut pager =
                Pager::create_file(&path, 512, 8, Arc::new(MemTracker::new())).unwrap();
            pager.alloc(PageKind::Header).unwrap();
            pager.flush_all().unwrap();
        }
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let pager = Pager::open_file(file, 512, 8, Arc::new(MemTracker::new())).unwrap();
        assert_eq!(pager.cached_len(), 0);
        assert!(!pager.is_in_memory());
    }
}
