//! Transaction manager
//!
//! A database has at most one active transaction. Public operations open a
//! private transaction when the caller has not begun one (the local-txn
//! wrapper in `db.rs`); an outer transaction spans as many operations as the
//! caller wants and commit/abort is then the caller's responsibility.
//!
//! While a transaction is active, the first mutation of each page journals
//! its pre-image so abort can restore the exact prior state; crash recovery
//! across process death is out of scope.

use std::collections::HashMap;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::PageKind;
use crate::types::{PageId, TxnId};

/// Handle for an active transaction.
#[derive(Debug)]
pub struct Txn {
    id: TxnId,
}

impl Txn {
    pub fn id(&self) -> TxnId {
        self.id
    }
}

/// Pre-image of a page at the time a transaction first touched it.
pub(crate) enum PageImage {
    /// The page existed; restore this kind and content on abort
    Existed { kind: PageKind, data: Vec<u8> },
    /// The page was allocated inside the transaction; discard it on abort
    Absent,
}

pub(crate) struct TxnState {
    active: Option<TxnId>,
    next_id: TxnId,
    journal: HashMap<PageId, PageImage>,
    root_page: PageId,
    freelist: Vec<PageId>,
}

impl TxnState {
    pub fn new() -> Self {
        TxnState {
            active: None,
            next_id: 1,
            journal: HashMap::new(),
            root_page: 0,
            freelist: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin a transaction, capturing the root page id and the free list so
    /// abort can roll them back.
    pub fn begin(&mut self, root_page: PageId, freelist: Vec<PageId>) -> Result<Txn> {
        if self.active.is_some() {
            return Err(Error::new(ErrorCode::TxnInProgress));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.active = Some(id);
        self.journal.clear();
        self.root_page = root_page;
        self.freelist = freelist;
        Ok(Txn { id })
    }

    fn check(&self, txn: &Txn) -> Result<()> {
        if self.active != Some(txn.id) {
            return Err(Error::with_message(
                ErrorCode::InvParameter,
                format!("transaction {} is not active", txn.id),
            ));
        }
        Ok(())
    }

    /// Finish the transaction, dropping its journal.
    pub fn commit(&mut self, txn: &Txn) -> Result<()> {
        self.check(txn)?;
        self.active = None;
        self.journal.clear();
        Ok(())
    }

    /// Finish the transaction, handing its journal to the caller for
    /// restoration.
    pub fn abort(&mut self, txn: &Txn) -> Result<(HashMap<PageId, PageImage>, PageId, Vec<PageId>)> {
        self.check(txn)?;
        self.active = None;
        let journal = std::mem::take(&mut self.journal);
        let freelist = std::mem::take(&mut self.freelist);
        Ok((journal, self.root_page, freelist))
    }

    /// Record the pre-image of a page about to be mutated. Only the first
    /// record per page within a transaction is kept.
    pub fn record(&mut self, id: PageId, image: PageImage) {
        if self.active.is_some() {
            self.journal.entry(id).or_insert(image);
        }
    }

    /// True when the page already has a journal entry for this transaction.
    pub fn journaled(&self, id: PageId) -> bool {
        self.active.is_some() && self.journal.contains_key(&id)
    }
}
