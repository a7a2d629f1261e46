//! Page codec and in-page cell allocator
//!
//! A page is a fixed-size byte array. Regular pages start with an 8-byte
//! page header; page 1 prefixes that with a 12-byte file header (two magic
//! words and the free-list head). Cells are chained in key order through
//! per-cell `next` offsets; unused bytes are chained through an
//! ascending-offset free-block list. Everything here operates on raw page
//! bytes plus a decoded [`PageAux`] view and never touches the page cache.
//!
//! All on-page integers are little-endian; all structures are 4-byte
//! aligned. Offsets are absolute within the page; 0 means "none".

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

// ============================================================================
// Constants
// ============================================================================

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Minimum page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Maximum page size. Bounded so every in-page offset fits a u16.
pub const MAX_PAGE_SIZE: usize = 32768;

/// First magic word of the file header on page 1.
pub const MAGIC_1: u32 = 0x7c3a_9e41;

/// Second magic word of the file header on page 1.
pub const MAGIC_2: u32 = 0x1d84_c0f6;

/// File header: magic1 u32, magic2 u32, free-list head u32.
pub const FILE_HDR_SIZE: usize = 12;

/// Page header: right-child u32, first-cell u16, first-free u16.
pub const PAGE_HDR_SIZE: usize = 8;

/// Cell header: left-child u32, next u16, key-size u16, data-size u32.
pub const CELL_HDR_SIZE: usize = 12;

/// Free block header and minimum free block size: size u16, next u16.
pub const FREE_BLOCK_SIZE: usize = 4;

/// Smallest possible cell footprint.
pub const MIN_CELL_SIZE: usize = CELL_HDR_SIZE + 4;

/// Byte offset of the free-list head within the file header.
const FILE_HDR_FREELIST: usize = 8;

// ============================================================================
// Little-endian byte helpers
// ============================================================================

pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Round a byte count up to a multiple of 4.
pub(crate) fn round4(n: usize) -> usize {
    (n + 3) & !3
}

// ============================================================================
// Page layout
// ============================================================================

/// Geometry of one page: size plus the header offset, which is nonzero only
/// on page 1 (the file header comes first there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub page_size: usize,
    pub hdr_offset: usize,
}

impl PageLayout {
    /// Layout of a regular page.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            hdr_offset: 0,
        }
    }

    /// Layout of page 1, which carries the file header first.
    pub fn for_page1(page_size: usize) -> Self {
        Self {
            page_size,
            hdr_offset: FILE_HDR_SIZE,
        }
    }

    /// Layout for the given page number.
    pub fn for_page(page_size: usize, pgno: Pgno) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size)
        } else {
            Self::new(page_size)
        }
    }

    /// First byte of the cell/free area.
    pub fn content_start(&self) -> usize {
        self.hdr_offset + PAGE_HDR_SIZE
    }

    /// Bytes available for cells and free blocks.
    pub fn usable(&self) -> usize {
        self.page_size - self.content_start()
    }

    /// Upper bound on cells per page; doubles as the cycle guard when
    /// walking the cell list.
    pub fn max_cell_count(&self) -> usize {
        self.usable() / MIN_CELL_SIZE
    }
}

/// Largest number of payload bytes stored inline in a cell. Derived so at
/// least four maximal cells fit on a regular page.
pub fn max_local(page_size: usize) -> usize {
    let per_cell = ((page_size - PAGE_HDR_SIZE) / 4) & !3;
    per_cell - CELL_HDR_SIZE - 4
}

/// Inline payload bytes for a cell with the given payload total.
pub fn local_payload(n_payload: usize, page_size: usize) -> usize {
    n_payload.min(max_local(page_size))
}

/// On-page footprint of a cell with the given key and data sizes.
pub fn cell_size_for(n_key: usize, n_data: usize, page_size: usize) -> usize {
    let n_payload = n_key + n_data;
    let mx = max_local(page_size);
    if n_payload > mx {
        CELL_HDR_SIZE + mx + 4
    } else {
        CELL_HDR_SIZE + round4(n_payload)
    }
}

// ============================================================================
// Cell accessors
// ============================================================================

pub(crate) fn cell_left_child(data: &[u8], off: usize) -> Pgno {
    read_u32(data, off)
}

pub(crate) fn set_cell_left_child(data: &mut [u8], off: usize, pgno: Pgno) {
    write_u32(data, off, pgno);
}

pub(crate) fn cell_next(data: &[u8], off: usize) -> u16 {
    read_u16(data, off + 4)
}

pub(crate) fn set_cell_next(data: &mut [u8], off: usize, next: u16) {
    write_u16(data, off + 4, next);
}

pub(crate) fn cell_key_size(data: &[u8], off: usize) -> usize {
    read_u16(data, off + 6) as usize
}

pub(crate) fn cell_data_size(data: &[u8], off: usize) -> usize {
    read_u32(data, off + 8) as usize
}

/// Total payload bytes (key then data) of the cell.
pub(crate) fn cell_payload_size(data: &[u8], off: usize) -> usize {
    cell_key_size(data, off) + cell_data_size(data, off)
}

/// First overflow page of the cell, or 0 when the payload is fully inline.
pub(crate) fn cell_overflow(data: &[u8], off: usize, page_size: usize) -> Pgno {
    let n_payload = cell_payload_size(data, off);
    let mx = max_local(page_size);
    if n_payload > mx {
        read_u32(data, off + CELL_HDR_SIZE + mx)
    } else {
        0
    }
}

/// On-page footprint of the cell at `off`, from its header fields.
pub(crate) fn cell_size(data: &[u8], off: usize, page_size: usize) -> usize {
    cell_size_for(cell_key_size(data, off), cell_data_size(data, off), page_size)
}

/// Inline payload slice of the cell at `off`.
pub(crate) fn cell_local_payload<'a>(data: &'a [u8], off: usize, page_size: usize) -> &'a [u8] {
    let local = local_payload(cell_payload_size(data, off), page_size);
    &data[off + CELL_HDR_SIZE..off + CELL_HDR_SIZE + local]
}

/// Copy the full on-page image of the cell at `off`.
pub(crate) fn cell_image(data: &[u8], off: usize, page_size: usize) -> Vec<u8> {
    data[off..off + cell_size(data, off, page_size)].to_vec()
}

/// Build a padded cell image from its parts. `overflow` must be nonzero
/// exactly when the payload exceeds the inline limit; `local` holds the
/// inline payload bytes (key first, then data).
pub(crate) fn build_cell_image(
    left_child: Pgno,
    n_key: usize,
    n_data: usize,
    local: &[u8],
    overflow: Pgno,
    page_size: usize,
) -> Vec<u8> {
    let size = cell_size_for(n_key, n_data, page_size);
    let mut image = vec![0u8; size];
    write_u32(&mut image, 0, left_child);
    write_u16(&mut image, 6, n_key as u16);
    write_u32(&mut image, 8, n_data as u32);
    image[CELL_HDR_SIZE..CELL_HDR_SIZE + local.len()].copy_from_slice(local);
    if overflow != 0 {
        write_u32(&mut image, CELL_HDR_SIZE + local.len(), overflow);
    }
    image
}

// ============================================================================
// File header (page 1)
// ============================================================================

pub(crate) fn read_magic(data: &[u8]) -> (u32, u32) {
    (read_u32(data, 0), read_u32(data, 4))
}

pub(crate) fn write_magic(data: &mut [u8]) {
    write_u32(data, 0, MAGIC_1);
    write_u32(data, 4, MAGIC_2);
}

pub(crate) fn read_freelist_head(data: &[u8]) -> Pgno {
    read_u32(data, FILE_HDR_FREELIST)
}

pub(crate) fn write_freelist_head(data: &mut [u8], head: Pgno) {
    write_u32(data, FILE_HDR_FREELIST, head);
}

// ============================================================================
// Decoded view
// ============================================================================

/// Decoded view of one B-tree page: header fields plus a random-access
/// vector of cell offsets in key order and the free-byte total.
#[derive(Debug, Clone, Default)]
pub struct PageAux {
    pub right_child: Pgno,
    pub cells: Vec<u16>,
    pub free_bytes: u32,
}

fn corrupt(message: &'static str) -> Error {
    Error::with_message(ErrorCode::Corrupt, message)
}

/// Initialise an empty page in place: no cells, no right child, one free
/// block covering the whole content area.
pub fn init_page(data: &mut [u8], layout: PageLayout) -> PageAux {
    let h = layout.hdr_offset;
    write_u32(data, h, 0);
    write_u16(data, h + 4, 0);
    let start = layout.content_start();
    let usable = layout.usable();
    write_u16(data, h + 6, start as u16);
    write_u16(data, start, usable as u16);
    write_u16(data, start + 2, 0);
    // Content after the free block header is dead; zero it for hygiene.
    data[start + FREE_BLOCK_SIZE..layout.page_size].fill(0);
    PageAux {
        right_child: 0,
        cells: Vec::new(),
        free_bytes: usable as u32,
    }
}

/// Parse a raw page into its decoded view, validating structure.
pub fn decode(data: &[u8], layout: PageLayout) -> Result<PageAux> {
    if data.len() < layout.page_size {
        return Err(corrupt("page shorter than page size"));
    }
    let h = layout.hdr_offset;
    let start = layout.content_start();
    let end = layout.page_size;

    let right_child = read_u32(data, h);
    let first_cell = read_u16(data, h + 4) as usize;
    let first_free = read_u16(data, h + 6) as usize;

    // Walk the cell list; the count bound doubles as the cycle guard.
    let mut cells = Vec::new();
    let mut cell_bytes = 0usize;
    let mut off = first_cell;
    while off != 0 {
        if off < start || off + CELL_HDR_SIZE > end || off % 4 != 0 {
            return Err(corrupt("cell offset out of range"));
        }
        let size = cell_size(data, off, layout.page_size);
        if off + size > end {
            return Err(corrupt("cell spills past page end"));
        }
        cells.push(off as u16);
        cell_bytes += size;
        if cells.len() > layout.max_cell_count() {
            return Err(corrupt("cell list cycle"));
        }
        off = cell_next(data, off) as usize;
    }

    // Walk the free-block list: strictly ascending, aligned, in range.
    let mut free_bytes = 0usize;
    let mut n_free = 0usize;
    let mut prev_end = 0usize;
    let mut off = first_free;
    while off != 0 {
        if off < start || off + FREE_BLOCK_SIZE > end || off % 4 != 0 {
            return Err(corrupt("free block offset out of range"));
        }
        if off < prev_end {
            return Err(corrupt("free list not ascending"));
        }
        let size = read_u16(data, off) as usize;
        if size < FREE_BLOCK_SIZE || size % 4 != 0 || off + size > end {
            return Err(corrupt("bad free block size"));
        }
        free_bytes += size;
        prev_end = off + size;
        n_free += 1;
        if n_free > layout.usable() / FREE_BLOCK_SIZE {
            return Err(corrupt("free list cycle"));
        }
        off = read_u16(data, off + 2) as usize;
    }

    if cell_bytes + free_bytes != layout.usable() {
        return Err(corrupt("page byte accounting mismatch"));
    }

    Ok(PageAux {
        right_child,
        cells,
        free_bytes: free_bytes as u32,
    })
}

/// Write the right-child header field.
pub fn set_right_child(data: &mut [u8], layout: PageLayout, aux: &mut PageAux, pgno: Pgno) {
    write_u32(data, layout.hdr_offset, pgno);
    aux.right_child = pgno;
}

// ============================================================================
// Allocator
// ============================================================================

/// Allocate `n` bytes (rounded up to a multiple of 4) from the free-block
/// list, first fit. Runs `defragment` and retries when no single block fits
/// but the total free space does. Returns `None` when the page is full.
pub fn alloc_chunk(
    data: &mut [u8],
    layout: PageLayout,
    aux: &mut PageAux,
    n: usize,
) -> Option<u16> {
    let n = round4(n);
    if let Some(off) = alloc_from_list(data, layout, n) {
        aux.free_bytes -= n as u32;
        return Some(off);
    }
    if (aux.free_bytes as usize) >= n {
        defragment(data, layout, aux);
        if let Some(off) = alloc_from_list(data, layout, n) {
            aux.free_bytes -= n as u32;
            return Some(off);
        }
    }
    None
}

fn alloc_from_list(data: &mut [u8], layout: PageLayout, n: usize) -> Option<u16> {
    let h = layout.hdr_offset;
    let mut prev: Option<usize> = None;
    let mut off = read_u16(data, h + 6) as usize;
    while off != 0 {
        let size = read_u16(data, off) as usize;
        let next = read_u16(data, off + 2);
        if size >= n {
            if size == n {
                // Exact fit: unlink the block.
                match prev {
                    Some(p) => write_u16(data, p + 2, next),
                    None => write_u16(data, h + 6, next),
                }
                return Some(off as u16);
            }
            // Take the allocation from the tail so links stay put.
            let remainder = size - n;
            write_u16(data, off, remainder as u16);
            return Some((off + remainder) as u16);
        }
        prev = Some(off);
        off = next as usize;
    }
    None
}

/// Return `size` bytes at `off` to the free list, coalescing with the
/// neighbouring blocks when they touch.
pub fn free_chunk(data: &mut [u8], layout: PageLayout, aux: &mut PageAux, off: usize, size: usize) {
    let size = round4(size);
    let h = layout.hdr_offset;
    aux.free_bytes += size as u32;

    // Locate the insertion point: prev is the last block before `off`.
    let mut prev: Option<usize> = None;
    let mut cur = read_u16(data, h + 6) as usize;
    while cur != 0 && cur < off {
        prev = Some(cur);
        cur = read_u16(data, cur + 2) as usize;
    }

    let mut block_off = off;
    let mut block_size = size;
    let mut next = cur;

    // Coalesce with the successor.
    if next != 0 && off + size == next {
        block_size += read_u16(data, next) as usize;
        next = read_u16(data, next + 2) as usize;
    }

    // Coalesce with the predecessor.
    if let Some(p) = prev {
        let p_size = read_u16(data, p) as usize;
        if p + p_size == off {
            block_off = p;
            block_size += p_size;
            write_u16(data, block_off, block_size as u16);
            write_u16(data, block_off + 2, next as u16);
            return;
        }
    }

    write_u16(data, block_off, block_size as u16);
    write_u16(data, block_off + 2, next as u16);
    match prev {
        Some(p) => write_u16(data, p + 2, block_off as u16),
        None => write_u16(data, h + 6, block_off as u16),
    }
}

/// Rewrite the page so all live cells sit contiguously at the start of the
/// content area, in key order, with one trailing free block. The cell list
/// is re-linked in the same order.
pub fn defragment(data: &mut [u8], layout: PageLayout, aux: &mut PageAux) {
    let start = layout.content_start();
    let mut packed: Vec<u8> = Vec::with_capacity(layout.usable());
    let mut new_offsets: Vec<u16> = Vec::with_capacity(aux.cells.len());

    for &off in &aux.cells {
        let image = cell_image(data, off as usize, layout.page_size);
        new_offsets.push((start + packed.len()) as u16);
        packed.extend_from_slice(&image);
    }

    data[start..start + packed.len()].copy_from_slice(&packed);

    // Re-link in the same key order.
    let h = layout.hdr_offset;
    write_u16(data, h + 4, new_offsets.first().copied().unwrap_or(0));
    for (i, &off) in new_offsets.iter().enumerate() {
        let next = new_offsets.get(i + 1).copied().unwrap_or(0);
        set_cell_next(data, off as usize, next);
    }

    // One trailing free block covers the remainder.
    let tail = start + packed.len();
    let remaining = layout.page_size - tail;
    if remaining > 0 {
        write_u16(data, h + 6, tail as u16);
        write_u16(data, tail, remaining as u16);
        write_u16(data, tail + 2, 0);
        data[tail + FREE_BLOCK_SIZE..layout.page_size].fill(0);
    } else {
        write_u16(data, h + 6, 0);
    }

    aux.cells = new_offsets;
    aux.free_bytes = remaining as u32;
}

// ============================================================================
// Cell list editing
// ============================================================================

/// Insert a cell image at list position `idx`. Returns `false` when the
/// page has no room even after defragmentation.
pub fn try_insert_cell(
    data: &mut [u8],
    layout: PageLayout,
    aux: &mut PageAux,
    idx: usize,
    image: &[u8],
) -> bool {
    debug_assert_eq!(image.len() % 4, 0);
    let off = match alloc_chunk(data, layout, aux, image.len()) {
        Some(off) => off as usize,
        None => return false,
    };
    data[off..off + image.len()].copy_from_slice(image);

    let h = layout.hdr_offset;
    let next = aux.cells.get(idx).copied().unwrap_or(0);
    set_cell_next(data, off, next);
    if idx == 0 {
        write_u16(data, h + 4, off as u16);
    } else {
        set_cell_next(data, aux.cells[idx - 1] as usize, off as u16);
    }
    aux.cells.insert(idx, off as u16);
    true
}

/// Unlink the cell at list position `idx` and return its bytes to the free
/// list. The cell's overflow chain, if any, is the caller's concern.
pub fn remove_cell(data: &mut [u8], layout: PageLayout, aux: &mut PageAux, idx: usize) {
    let off = aux.cells[idx] as usize;
    let size = cell_size(data, off, layout.page_size);
    let next = cell_next(data, off);
    let h = layout.hdr_offset;
    if idx == 0 {
        write_u16(data, h + 4, next);
    } else {
        set_cell_next(data, aux.cells[idx - 1] as usize, next);
    }
    aux.cells.remove(idx);
    free_chunk(data, layout, aux, off, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page() -> (Vec<u8>, PageLayout, PageAux) {
        let layout = PageLayout::new(DEFAULT_PAGE_SIZE);
        let mut data = vec![0u8; DEFAULT_PAGE_SIZE];
        let aux = init_page(&mut data, layout);
        (data, layout, aux)
    }

    fn image(key: &[u8], data_bytes: &[u8]) -> Vec<u8> {
        let mut local = key.to_vec();
        local.extend_from_slice(data_bytes);
        build_cell_image(0, key.len(), data_bytes.len(), &local, 0, DEFAULT_PAGE_SIZE)
    }

    #[test]
    fn test_limits() {
        assert_eq!(max_local(1024), 236);
        assert_eq!(cell_size_for(3, 80, 1024), CELL_HDR_SIZE + 84);
        // Four maximal cells fit on one page.
        let max_cell = cell_size_for(0, 10_000, 1024);
        assert_eq!(max_cell, CELL_HDR_SIZE + 236 + 4);
        assert!(4 * max_cell <= 1024 - PAGE_HDR_SIZE);
    }

    #[test]
    fn test_init_then_decode() {
        let (data, layout, aux) = fresh_page();
        let decoded = decode(&data, layout).unwrap();
        assert_eq!(decoded.cells.len(), 0);
        assert_eq!(decoded.free_bytes, aux.free_bytes);
        assert_eq!(decoded.right_child, 0);
    }

    #[test]
    fn test_insert_remove_roundtrip() {
        let (mut data, layout, mut aux) = fresh_page();
        assert!(try_insert_cell(&mut data, layout, &mut aux, 0, &image(b"bbb", b"2")));
        assert!(try_insert_cell(&mut data, layout, &mut aux, 0, &image(b"aaa", b"1")));
        assert!(try_insert_cell(&mut data, layout, &mut aux, 2, &image(b"ccc", b"3")));

        let decoded = decode(&data, layout).unwrap();
        assert_eq!(decoded.cells, aux.cells);
        let keys: Vec<&[u8]> = aux
            .cells
            .iter()
            .map(|&off| {
                let off = off as usize;
                &data[off + CELL_HDR_SIZE..off + CELL_HDR_SIZE + 3]
            })
            .collect();
        assert_eq!(keys, vec![&b"aaa"[..], b"bbb", b"ccc"]);

        remove_cell(&mut data, layout, &mut aux, 1);
        let decoded = decode(&data, layout).unwrap();
        assert_eq!(decoded.cells.len(), 2);
    }

    #[test]
    fn test_free_coalescing() {
        let (mut data, layout, mut aux) = fresh_page();
        let total = aux.free_bytes;
        for _ in 0..5 {
            assert!(try_insert_cell(&mut data, layout, &mut aux, 0, &image(b"k", b"v")));
        }
        while !aux.cells.is_empty() {
            remove_cell(&mut data, layout, &mut aux, 0);
        }
        // Everything coalesces back into a single block.
        assert_eq!(aux.free_bytes, total);
        let first_free = read_u16(&data, layout.hdr_offset + 6) as usize;
        assert_eq!(read_u16(&data, first_free) as u32, total);
        assert_eq!(read_u16(&data, first_free + 2), 0);
    }

    #[test]
    fn test_defragment_keeps_order() {
        let (mut data, layout, mut aux) = fresh_page();
        for key in [b"a", b"b", b"c", b"d", b"e"] {
            let idx = aux.cells.len();
            assert!(try_insert_cell(&mut data, layout, &mut aux, idx, &image(key, b"xx")));
        }
        remove_cell(&mut data, layout, &mut aux, 1);
        remove_cell(&mut data, layout, &mut aux, 2);
        defragment(&mut data, layout, &mut aux);

        let decoded = decode(&data, layout).unwrap();
        let keys: Vec<u8> = decoded
            .cells
            .iter()
            .map(|&off| data[off as usize + CELL_HDR_SIZE])
            .collect();
        assert_eq!(keys, b"ace".to_vec());
        // Single trailing free block.
        let first_free = read_u16(&data, layout.hdr_offset + 6) as usize;
        assert_eq!(read_u16(&data, first_free + 2), 0);
    }

    #[test]
    fn test_alloc_uses_defragment_when_fragmented() {
        let (mut data, layout, mut aux) = fresh_page();
        // Fill the page with small cells.
        let mut n = 0;
        while try_insert_cell(&mut data, layout, &mut aux, 0, &image(b"k", b"v")) {
            n += 1;
        }
        assert!(n > 10);
        // Free every other cell; the holes are non-adjacent.
        let mut idx = 0;
        while idx < aux.cells.len() {
            remove_cell(&mut data, layout, &mut aux, idx);
            idx += 1;
        }
        // A large cell only fits after defragmentation.
        let big = image(b"key", &vec![0x55u8; 120]);
        assert!(try_insert_cell(&mut data, layout, &mut aux, 0, &big));
        decode(&data, layout).unwrap();
    }

    #[test]
    fn test_decode_detects_cycle() {
        let (mut data, layout, mut aux) = fresh_page();
        assert!(try_insert_cell(&mut data, layout, &mut aux, 0, &image(b"a", b"1")));
        let off = aux.cells[0] as usize;
        // Point the cell at itself.
        set_cell_next(&mut data, off, off as u16);
        let err = decode(&data, layout).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_decode_detects_bad_offsets() {
        let (mut data, layout, _aux) = fresh_page();
        // First-cell offset beyond the page.
        write_u16(&mut data, layout.hdr_offset + 4, (DEFAULT_PAGE_SIZE - 2) as u16);
        assert_eq!(decode(&data, layout).unwrap_err().code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_decode_detects_accounting_mismatch() {
        let (mut data, layout, _aux) = fresh_page();
        let start = layout.content_start();
        // Shrink the lone free block without accounting for the bytes.
        let size = read_u16(&data, start);
        write_u16(&mut data, start, size - 8);
        assert_eq!(decode(&data, layout).unwrap_err().code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_decode_detects_unordered_free_list() {
        let (mut data, layout, _aux) = fresh_page();
        let start = layout.content_start();
        let usable = layout.usable();
        // Two blocks linked high-to-low.
        let half = round4(usable / 2);
        let second = start + half;
        write_u16(&mut data, layout.hdr_offset + 6, second as u16);
        write_u16(&mut data, second, (usable - half) as u16);
        write_u16(&mut data, second + 2, start as u16);
        write_u16(&mut data, start, half as u16);
        write_u16(&mut data, start + 2, 0);
        assert_eq!(decode(&data, layout).unwrap_err().code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_page1_layout() {
        let layout = PageLayout::for_page1(DEFAULT_PAGE_SIZE);
        let mut data = vec![0u8; DEFAULT_PAGE_SIZE];
        write_magic(&mut data);
        write_freelist_head(&mut data, 7);
        init_page(&mut data, layout);

        assert_eq!(read_magic(&data), (MAGIC_1, MAGIC_2));
        assert_eq!(read_freelist_head(&data), 7);
        let decoded = decode(&data, layout).unwrap();
        assert_eq!(decoded.free_bytes as usize, DEFAULT_PAGE_SIZE - FILE_HDR_SIZE - PAGE_HDR_SIZE);
    }
}
