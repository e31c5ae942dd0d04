//! rustkv — an embedded key/value store built on an on-disk B+-tree
//!
//! A single process opens a database file (or an anonymous in-memory image),
//! inserts, finds, overwrites and erases variable-length key/record pairs,
//! and walks them in key order through stateful cursors. Small records are
//! inlined into the tree nodes; larger ones live in a blob store. Every
//! public operation runs inside a transaction: the caller's, or a private
//! one that commits on success and aborts on failure.
//!
//! ```no_run
//! use rustkv::{Config, Database, InsertFlags};
//!
//! let db = Database::create(None, Config::default())?;
//! db.insert(b"alpha", b"1", InsertFlags::empty())?;
//! db.insert(b"beta", b"2", InsertFlags::empty())?;
//!
//! let mut cursor = db.cursor()?;
//! let (key, record) = cursor.first()?;
//! assert_eq!((key.as_slice(), record.as_slice()), (&b"alpha"[..], &b"1"[..]));
//! # Ok::<(), rustkv::Error>(())
//! ```

pub mod db;
pub mod error;
pub mod mem;
pub mod storage;
pub mod txn;
pub mod types;

// Re-export the public surface
pub use db::Database;
pub use error::{Error, ErrorCode, Result};
pub use mem::MemTracker;
pub use storage::btree::cursor::Cursor;
pub use storage::btree::types::{Direction, Fetch, InsertFlags};
pub use txn::Txn;
pub use types::{Config, KeyComparator, PageId};
