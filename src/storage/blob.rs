//! Blob store
//!
//! Records larger than a slot pointer word live out-of-node in chains of
//! blob-typed pages. A blob id is the page id of the first page in the
//! chain. The first page carries the total record length; every page carries
//! the id of the next page in the chain (0 terminates it).

use crate::db::DbState;
use crate::error::{Error, ErrorCode, Result};
use crate::storage::pager::PageKind;
use crate::types::{BlobId, PageId};

/// Bytes reserved at the start of every blob page
pub const BLOB_HEADER_SIZE: usize = 24;

const OFF_NEXT: usize = 8;
const OFF_LEN: usize = 16;

fn payload_capacity(page_size: u32) -> usize {
    page_size as usize - BLOB_HEADER_SIZE
}

fn read_next(data: &[u8]) -> PageId {
    u64::from_le_bytes(data[OFF_NEXT..OFF_NEXT + 8].try_into().unwrap_or([0; 8]))
}

fn chain_pages(len: usize, cap: usize) -> usize {
    if len == 0 {
        1
    } else {
        (len + cap - 1) / cap
    }
}

/// Store `data` in a fresh chain and return its blob id.
pub(crate) fn allocate(state: &mut DbState, data: &[u8]) -> Result<BlobId> {
    let cap = payload_capacity(state.page_size());
    let wanted = chain_pages(data.len(), cap);

    let mut ids = Vec::with_capacity(wanted);
    for _ in 0..wanted {
        match state.alloc_page(PageKind::Blob) {
            Ok(id) => ids.push(id),
            Err(err) => {
                for id in ids {
                    let _ = state.free_page(id);
                }
                return Err(err);
            }
        }
    }

    write_chain(state, &ids, data)?;
    Ok(ids[0])
}

/// Read the record bytes stored under `id`.
pub(crate) fn read(state: &mut DbState, id: BlobId) -> Result<Vec<u8>> {
    let cap = payload_capacity(state.page_size());
    let (total, mut next) = {
        let page = state.fetch_page(id)?;
        if page.kind != PageKind::Blob {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} is not a blob page", id),
            ));
        }
        let total = u64::from_le_bytes(page.data[OFF_LEN..OFF_LEN + 8].try_into().unwrap_or([0; 8]));
        (total as usize, id)
    };

    let mut out = Vec::with_capacity(total);
    let mut remaining = total;
    while remaining > 0 {
        if next == 0 {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("blob chain {} ends short of its length", id),
            ));
        }
        let page = state.fetch_page(next)?;
        let take = remaining.min(cap);
        out.extend_from_slice(&page.data[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + take]);
        next = read_next(&page.data);
        remaining -= take;
    }
    Ok(out)
}

/// Replace the record stored under `id` with `data`.
///
/// The chain is reused when the new record needs no more pages than the old
/// one; otherwise the chain is freed and reallocated and the returned id
/// replaces the caller's.
pub(crate) fn overwrite(state: &mut DbState, id: BlobId, data: &[u8]) -> Result<BlobId> {
    let cap = payload_capacity(state.page_size());
    let old_chain = collect_chain(state, id)?;
    let wanted = chain_pages(data.len(), cap);

    if wanted <= old_chain.len() {
        let keep = &old_chain[..wanted];
        for id in &old_chain[wanted..] {
            state.free_page(*id)?;
        }
        write_chain(state, keep, data)?;
        return Ok(id);
    }

    free_pages(state, &old_chain)?;
    allocate(state, data)
}

/// Release the chain stored under `id` back to the pager.
pub(crate) fn free(state: &mut DbState, id: BlobId) -> Result<()> {
    let chain = collect_chain(state, id)?;
    free_pages(state, &chain)
}

fn collect_chain(state: &mut DbState, id: BlobId) -> Result<Vec<PageId>> {
    let mut ids = Vec::new();
    let mut next = id;
    while next != 0 {
        let page = state.fetch_page(next)?;
        if page.kind != PageKind::Blob {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} is not a blob page", next),
            ));
        }
        ids.push(next);
        next = read_next(&page.data);
    }
    Ok(ids)
}

fn free_pages(state: &mut DbState, ids: &[PageId]) -> Result<()> {
    for id in ids {
        state.free_page(*id)?;
    }
    Ok(())
}

fn write_chain(state: &mut DbState, ids: &[PageId], data: &[u8]) -> Result<()> {
    let cap = payload_capacity(state.page_size());
    for (i, id) in ids.iter().enumerate() {
        let next = if i + 1 < ids.len() { ids[i + 1] } else { 0 };
        let chunk_start = i * cap;
        let chunk_end = data.len().min(chunk_start + cap);
        let page = state.page_for_write(*id)?;
        page.data[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&next.to_le_bytes());
        let len_field = if i == 0 { data.len() as u64 } else { 0 };
        page.data[OFF_LEN..OFF_LEN + 8].copy_from_slice(&len_field.to_le_bytes());
        let payload = &mut page.data[BLOB_HEADER_SIZE..];
        for b in payload.iter_mut() {
            *b = 0;
        }
        if chunk_start < chunk_end {
            payload[..chunk_end - chunk_start].copy_from_slice(&data[chunk_start..chunk_end]);
        }
    }
    Ok(())
}
