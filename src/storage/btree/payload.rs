//! Overflow chains and the file-wide free-page list
//!
//! Payloads larger than the inline limit spill into a chain of overflow
//! pages: `{next-page u32, raw bytes}` with next = 0 on the final page.
//! Freed pages are recycled through a LIFO list rooted in the file header;
//! a free page has exactly the overflow shape with a zeroed body, so the
//! two are one physical variant distinguished only by reachability.

use std::cmp::Ordering;

use log::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::{
    self, cell_key_size, cell_local_payload, cell_overflow, cell_payload_size, local_payload,
    read_freelist_head, read_u32, write_freelist_head, write_u32,
};
use crate::storage::pager::{PageHandle, Pager};
use crate::types::Pgno;

/// Bytes of an overflow page taken by the next-page link.
pub(crate) const OVFL_HDR: usize = 4;

/// Payload bytes carried per overflow page.
pub(crate) fn ovfl_body(page_size: usize) -> usize {
    page_size - OVFL_HDR
}

// ============================================================================
// Free-page list
// ============================================================================

/// Pop a page off the free list, or extend the file by one page. The page
/// comes back pinned, zeroed, and journaled.
pub(crate) fn allocate_page(pager: &mut Pager) -> Result<(Pgno, PageHandle)> {
    let page1 = pager.get(1)?;
    let head = read_freelist_head(&page1.borrow().data);
    if head == 0 {
        let page = pager.allocate()?;
        let pgno = page.borrow().pgno;
        return Ok((pgno, page));
    }

    let page = pager.get(head)?;
    let next = read_u32(&page.borrow().data, 0);
    pager.write(&page1)?;
    write_freelist_head(&mut page1.borrow_mut().data, next);
    pager.write(&page)?;
    {
        let mut hdr = page.borrow_mut();
        hdr.data.fill(0);
        hdr.aux = None;
    }
    trace!("freelist: reuse page {head}, next head {next}");
    Ok((head, page))
}

/// Push a page onto the free list. The body is zeroed and the previous
/// head becomes the page's next link.
pub(crate) fn free_page(pager: &mut Pager, pgno: Pgno) -> Result<()> {
    let page1 = pager.get(1)?;
    let old_head = read_freelist_head(&page1.borrow().data);

    let page = pager.get(pgno)?;
    pager.write(&page)?;
    {
        let mut hdr = page.borrow_mut();
        hdr.data.fill(0);
        write_u32(&mut hdr.data, 0, old_head);
        hdr.aux = None;
    }

    pager.write(&page1)?;
    write_freelist_head(&mut page1.borrow_mut().data, pgno);
    trace!("freelist: free page {pgno}");
    Ok(())
}

// ============================================================================
// Overflow chains
// ============================================================================

/// Spill `rest` (the payload bytes past the inline limit) into a fresh
/// overflow chain, filling each page end-to-end. Returns the first page.
pub(crate) fn write_overflow(pager: &mut Pager, rest: &[u8]) -> Result<Pgno> {
    debug_assert!(!rest.is_empty());
    let body = ovfl_body(pager.page_size);

    let (first, mut page) = allocate_page(pager)?;
    let mut written = 0usize;
    loop {
        let n = (rest.len() - written).min(body);
        {
            let mut hdr = page.borrow_mut();
            hdr.data[OVFL_HDR..OVFL_HDR + n].copy_from_slice(&rest[written..written + n]);
        }
        written += n;
        if written == rest.len() {
            break;
        }
        let (next_pgno, next_page) = allocate_page(pager)?;
        write_u32(&mut page.borrow_mut().data, 0, next_pgno);
        page = next_page;
    }
    Ok(first)
}

/// Free every page of the overflow chain starting at `first` (0 = none).
pub(crate) fn clear_overflow(pager: &mut Pager, first: Pgno) -> Result<()> {
    let mut pgno = first;
    while pgno != 0 {
        let page = pager.get(pgno)?;
        let next = read_u32(&page.borrow().data, 0);
        drop(page);
        free_page(pager, pgno)?;
        pgno = next;
    }
    Ok(())
}

/// Free the overflow chain referenced by the cell at `off`, if any.
pub(crate) fn clear_cell_overflow(pager: &mut Pager, page: &PageHandle, off: usize) -> Result<()> {
    let first = cell_overflow(&page.borrow().data, off, pager.page_size);
    clear_overflow(pager, first)
}

/// Copy `amount` payload bytes starting at `offset` from the cell at
/// `off`, streaming from the inline bytes and then the overflow chain.
/// The window is over the whole payload (key bytes first, then data).
pub(crate) fn read_payload(
    pager: &mut Pager,
    page: &PageHandle,
    off: usize,
    offset: usize,
    amount: usize,
) -> Result<Vec<u8>> {
    let page_size = pager.page_size;
    let (n_payload, local, first_ovfl) = {
        let hdr = page.borrow();
        let n_payload = cell_payload_size(&hdr.data, off);
        (
            n_payload,
            local_payload(n_payload, page_size),
            cell_overflow(&hdr.data, off, page_size),
        )
    };
    if offset.checked_add(amount).map_or(true, |end| end > n_payload) {
        return Err(Error::with_message(
            ErrorCode::Error,
            "payload read out of range",
        ));
    }

    let mut out = Vec::with_capacity(amount);

    // Inline portion.
    if offset < local {
        let n = (local - offset).min(amount);
        let hdr = page.borrow();
        let inline = cell_local_payload(&hdr.data, off, page_size);
        out.extend_from_slice(&inline[offset..offset + n]);
    }

    // Overflow portion.
    if out.len() < amount {
        let mut skip = offset.saturating_sub(local);
        let mut pgno = first_ovfl;
        let body = ovfl_body(page_size);
        while out.len() < amount {
            if pgno == 0 {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "overflow chain too short",
                ));
            }
            let ovfl = pager.get(pgno)?;
            let hdr = ovfl.borrow();
            if skip >= body {
                skip -= body;
            } else {
                let n = (body - skip).min(amount - out.len());
                out.extend_from_slice(&hdr.data[OVFL_HDR + skip..OVFL_HDR + skip + n]);
                skip = 0;
            }
            pgno = read_u32(&hdr.data, 0);
        }
    }

    Ok(out)
}

/// Materialise the full key of the cell at `off`.
pub(crate) fn read_full_key(pager: &mut Pager, page: &PageHandle, off: usize) -> Result<Vec<u8>> {
    let n_key = cell_key_size(&page.borrow().data, off);
    read_payload(pager, page, off, 0, n_key)
}

/// Bytewise-compare the key of the cell at `off` against `probe`, pulling
/// overflow pages only as far as a decision requires.
pub(crate) fn compare_key(
    pager: &mut Pager,
    page: &PageHandle,
    off: usize,
    probe: &[u8],
) -> Result<Ordering> {
    let page_size = pager.page_size;
    let (n_key, inline_key, first_ovfl) = {
        let hdr = page.borrow();
        let n_key = cell_key_size(&hdr.data, off);
        let inline = cell_local_payload(&hdr.data, off, page_size);
        let inline_key_len = n_key.min(inline.len());
        (
            n_key,
            inline[..inline_key_len].to_vec(),
            cell_overflow(&hdr.data, off, page_size),
        )
    };

    // Inline prefix decides most comparisons.
    let n = inline_key.len().min(probe.len());
    match inline_key[..n].cmp(&probe[..n]) {
        Ordering::Equal => {}
        ord => return Ok(ord),
    }
    if n_key == inline_key.len() || probe.len() <= n {
        // The key has no overflowed bytes left to compare, or the probe is
        // exhausted; lengths decide.
        return Ok(n_key.cmp(&probe.len()));
    }

    // Stream the overflowed key tail. The overflow stream begins with the
    // key bytes past the inline limit.
    let mut key_pos = inline_key.len();
    let mut probe_rest = &probe[n..];
    let mut pgno = first_ovfl;
    let body = ovfl_body(page_size);
    while key_pos < n_key {
        if pgno == 0 {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "overflow chain too short",
            ));
        }
        let ovfl = pager.get(pgno)?;
        let hdr = ovfl.borrow();
        let chunk_len = (n_key - key_pos).min(body);
        let chunk = &hdr.data[OVFL_HDR..OVFL_HDR + chunk_len];
        let m = chunk.len().min(probe_rest.len());
        match chunk[..m].cmp(&probe_rest[..m]) {
            Ordering::Equal => {}
            ord => return Ok(ord),
        }
        if probe_rest.len() <= m {
            // Probe exhausted while key bytes remain (or end together).
            break;
        }
        probe_rest = &probe_rest[m..];
        key_pos += chunk.len();
        pgno = read_u32(&hdr.data, 0);
    }
    Ok(n_key.cmp(&probe.len()))
}

/// Build the on-page cell image for a key/value pair, spilling payload
/// past the inline limit into a new overflow chain.
pub(crate) fn fill_in_cell(
    pager: &mut Pager,
    left_child: Pgno,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    let page_size = pager.page_size;
    let n_payload = key.len() + data.len();
    let local = local_payload(n_payload, page_size);

    let mut payload = Vec::with_capacity(n_payload.min(local));
    let inline_key = key.len().min(local);
    payload.extend_from_slice(&key[..inline_key]);
    if payload.len() < local {
        payload.extend_from_slice(&data[..local - inline_key]);
    }

    let overflow = if n_payload > local {
        let mut rest = Vec::with_capacity(n_payload - local);
        if inline_key < key.len() {
            rest.extend_from_slice(&key[inline_key..]);
            rest.extend_from_slice(data);
        } else {
            rest.extend_from_slice(&data[local - inline_key..]);
        }
        write_overflow(pager, &rest)?
    } else {
        0
    };

    Ok(page::build_cell_image(
        left_child,
        key.len(),
        data.len(),
        &payload,
        overflow,
        page_size,
    ))
}
