//! Storage layer: pager, blob store, extended-key cache, and the B+-tree

pub mod blob;
pub mod btree;
pub mod extkey;
pub mod pager;
