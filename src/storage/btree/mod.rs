//! B-tree store
//!
//! A database file holds any number of named B-trees sharing one page
//! file. Cells carry full key/value payloads on every level; interior
//! cells additionally carry a left-child pointer, and each page header
//! carries a rightmost-child pointer. The distinguished table rooted at
//! page 2 maps lowercased table names to root page numbers.
//!
//! Cursors own their root-to-leaf path as a stack of pinned page handles,
//! so ascending and descending never re-search from the root and there are
//! no page-to-parent back pointers to keep alive.

mod cursor;
mod payload;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::vfs_find;
use crate::storage::page::{
    self, cell_data_size, cell_image, cell_key_size, cell_left_child, cell_overflow,
    cell_payload_size, local_payload, read_freelist_head, read_magic, read_u32, write_freelist_head,
    write_magic, write_u32, PageAux, PageLayout, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::storage::pager::{PageHandle, Pager, PgHdr};
use crate::types::Pgno;

pub use cursor::BtCursor;
use payload::{
    allocate_page, clear_cell_overflow, clear_overflow, compare_key, fill_in_cell, free_page,
    ovfl_body, read_full_key, read_payload,
};

// ============================================================================
// Constants and configuration
// ============================================================================

/// Root page of the distinguished table mapping names to root pages.
pub const MASTER_ROOT: Pgno = 2;

/// Upper bound on tree depth; a deeper path means a child-pointer cycle.
pub(crate) const MAX_DEPTH: usize = 40;

/// Transaction state of a B-tree handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    None,
    Read,
    Write,
}

/// Client-supplied total order over fully materialised keys.
pub type KeyCompare = Box<dyn Fn(&[u8], &[u8]) -> Ordering>;

/// Open-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    /// Page size in bytes; a power of two. A database must be reopened
    /// with the page size it was created with.
    pub page_size: usize,
    /// Page-cache budget in pages.
    pub cache_pages: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 256,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct BtShared {
    pub(crate) pager: Pager,
    pub(crate) page_size: usize,
    pub(crate) in_trans: TransState,
    /// Bumped on commit, rollback, and every structural change; cursors
    /// holding an older generation must re-seek.
    pub(crate) gen: u64,
    pub(crate) open_cursors: Vec<u64>,
    pub(crate) next_cursor_id: u64,
    pub(crate) closed: bool,
    comparator: Option<KeyCompare>,
}

/// One level of a cursor's root-to-leaf path. `slot` is the cell index the
/// cursor rests on (top entry) or the child slot it descended through
/// (ancestors); slot `n` of a page with `n` cells is the rightmost child.
pub(crate) struct PathEntry {
    pub(crate) page: PageHandle,
    pub(crate) slot: usize,
}

impl BtShared {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::with_message(ErrorCode::Error, "database closed"));
        }
        Ok(())
    }

    pub(crate) fn require_write(&self) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Err(Error::with_message(ErrorCode::Error, "no write transaction"));
        }
        Ok(())
    }

    /// Fetch a page and decode its B-tree view if this is the first visit.
    pub(crate) fn fetch_page(&mut self, pgno: Pgno) -> Result<PageHandle> {
        let page = self.pager.get(pgno)?;
        if page.borrow().aux.is_none() {
            let layout = PageLayout::for_page(self.page_size, pgno);
            let aux = page::decode(&page.borrow().data, layout)?;
            page.borrow_mut().aux = Some(aux);
        }
        Ok(page)
    }

    /// Full-key ordering: the client comparator when installed, bytewise
    /// otherwise.
    pub(crate) fn order_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.comparator {
            Some(cmp) => cmp(a, b),
            None => a.cmp(b),
        }
    }
}

// ============================================================================
// Page view helpers
// ============================================================================

fn layout_of(page_size: usize, page: &PageHandle) -> PageLayout {
    PageLayout::for_page(page_size, page.borrow().pgno)
}

fn n_cells(page: &PageHandle) -> usize {
    page.borrow().aux.as_ref().map_or(0, |aux| aux.cells.len())
}

fn cells_of(page: &PageHandle) -> Vec<u16> {
    page.borrow().aux.as_ref().map_or_else(Vec::new, |aux| aux.cells.clone())
}

fn right_child_of(page: &PageHandle) -> Pgno {
    page.borrow().aux.as_ref().map_or(0, |aux| aux.right_child)
}

fn free_bytes_of(page: &PageHandle) -> usize {
    page.borrow().aux.as_ref().map_or(0, |aux| aux.free_bytes as usize)
}

fn cell_at(page: &PageHandle, idx: usize) -> usize {
    page.borrow().aux.as_ref().map_or(0, |aux| aux.cells[idx] as usize)
}

/// Child page at slot `t`: the left child of cell `t`, or the rightmost
/// child for slot `n`.
fn child_at(page: &PageHandle, t: usize) -> Pgno {
    let hdr = page.borrow();
    let aux = match hdr.aux.as_ref() {
        Some(aux) => aux,
        None => return 0,
    };
    if t < aux.cells.len() {
        cell_left_child(&hdr.data, aux.cells[t] as usize)
    } else {
        aux.right_child
    }
}

/// Run `f` against a page's raw bytes and decoded view together.
fn with_page_mut<T>(
    page: &PageHandle,
    f: impl FnOnce(&mut [u8], &mut PageAux) -> T,
) -> Result<T> {
    let mut hdr = page.borrow_mut();
    let PgHdr {
        ref mut data,
        ref mut aux,
        ..
    } = *hdr;
    let aux = aux
        .as_mut()
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "page not decoded"))?;
    Ok(f(data, aux))
}

/// Replace a page's content with the given cell images and right child.
fn rebuild_page(
    page: &PageHandle,
    layout: PageLayout,
    images: &[Vec<u8>],
    right_child: Pgno,
) -> Result<()> {
    let mut hdr = page.borrow_mut();
    let PgHdr {
        ref mut data,
        ref mut aux,
        ..
    } = *hdr;
    let mut new_aux = page::init_page(data, layout);
    for image in images {
        let idx = new_aux.cells.len();
        if !page::try_insert_cell(data, layout, &mut new_aux, idx, image) {
            return Err(Error::with_message(ErrorCode::Internal, "page rebuild overflow"));
        }
    }
    page::set_right_child(data, layout, &mut new_aux, right_child);
    *aux = Some(new_aux);
    Ok(())
}

fn compare_cell_key(
    shared: &mut BtShared,
    page: &PageHandle,
    off: usize,
    probe: &[u8],
) -> Result<Ordering> {
    if shared.comparator.is_some() {
        let key = read_full_key(&mut shared.pager, page, off)?;
        Ok(shared.order_keys(&key, probe))
    } else {
        compare_key(&mut shared.pager, page, off, probe)
    }
}

// ============================================================================
// Search
// ============================================================================

/// Descend from `root` looking for `key`. The returned path ends on the
/// landing page; the result sign compares the landed-on cell against the
/// key (+1 with an invalid position means the tree is empty).
pub(crate) fn seek(
    shared: &mut BtShared,
    root: Pgno,
    key: &[u8],
) -> Result<(Vec<PathEntry>, i32, bool)> {
    let mut path = Vec::new();
    let mut pgno = root;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::with_message(ErrorCode::Corrupt, "tree too deep"));
        }
        let page = shared.fetch_page(pgno)?;
        let cells = cells_of(&page);
        let right_child = right_child_of(&page);

        let mut lo = 0usize;
        let mut hi = cells.len();
        let mut found = None;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_cell_key(shared, &page, cells[mid] as usize, key)? {
                Ordering::Equal => {
                    found = Some(mid);
                    break;
                }
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        if let Some(i) = found {
            path.push(PathEntry { page, slot: i });
            return Ok((path, 0, true));
        }

        let n = cells.len();
        let child = if lo < n {
            cell_left_child(&page.borrow().data, cells[lo] as usize)
        } else {
            right_child
        };
        if child != 0 {
            path.push(PathEntry { page, slot: lo });
            pgno = child;
            continue;
        }

        return if n == 0 {
            path.push(PathEntry { page, slot: 0 });
            Ok((path, 1, false))
        } else if lo < n {
            path.push(PathEntry { page, slot: lo });
            Ok((path, 1, true))
        } else {
            path.push(PathEntry { page, slot: n - 1 });
            Ok((path, -1, true))
        };
    }
}

/// Extend `path` down to the smallest cell of the subtree at `pgno`.
pub(crate) fn descend_to_min(
    shared: &mut BtShared,
    path: &mut Vec<PathEntry>,
    mut pgno: Pgno,
) -> Result<bool> {
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::with_message(ErrorCode::Corrupt, "tree too deep"));
        }
        let page = shared.fetch_page(pgno)?;
        let cells = cells_of(&page);
        if cells.is_empty() {
            let rc = right_child_of(&page);
            path.push(PathEntry { page, slot: 0 });
            if rc != 0 {
                pgno = rc;
                continue;
            }
            return Ok(false);
        }
        let lc = cell_left_child(&page.borrow().data, cells[0] as usize);
        path.push(PathEntry { page, slot: 0 });
        if lc != 0 {
            pgno = lc;
            continue;
        }
        return Ok(true);
    }
}

/// Extend `path` down to the largest cell of the subtree at `pgno`.
pub(crate) fn descend_to_max(
    shared: &mut BtShared,
    path: &mut Vec<PathEntry>,
    mut pgno: Pgno,
) -> Result<bool> {
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::with_message(ErrorCode::Corrupt, "tree too deep"));
        }
        let page = shared.fetch_page(pgno)?;
        let n = n_cells(&page);
        let rc = right_child_of(&page);
        if rc != 0 {
            path.push(PathEntry { page, slot: n });
            pgno = rc;
            continue;
        }
        if n == 0 {
            path.push(PathEntry { page, slot: 0 });
            return Ok(false);
        }
        path.push(PathEntry { page, slot: n - 1 });
        return Ok(true);
    }
}

// ============================================================================
// Insert and balance
// ============================================================================

/// Insert a key/value pair at a position found by [`seek`]. An equal key
/// is unlinked first (overwrite semantics), then the new cell goes through
/// the balance loop.
pub(crate) fn insert_at(
    shared: &mut BtShared,
    path: &mut Vec<PathEntry>,
    res: i32,
    valid: bool,
    key: &[u8],
    data: &[u8],
) -> Result<()> {
    if key.is_empty() || key.len() > u16::MAX as usize {
        return Err(Error::with_message(ErrorCode::Error, "bad key size"));
    }
    if data.len() > u32::MAX as usize {
        return Err(Error::with_message(ErrorCode::Error, "bad data size"));
    }

    let mut left_child = 0;
    let idx;
    {
        let top = path
            .last()
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        if res == 0 && valid {
            // Overwrite: drop the old cell, keeping its child pointer.
            let page = top.page.clone();
            let i = top.slot;
            let off = cell_at(&page, i);
            left_child = cell_left_child(&page.borrow().data, off);
            shared.pager.write(&page)?;
            clear_cell_overflow(&mut shared.pager, &page, off)?;
            let layout = layout_of(shared.page_size, &page);
            with_page_mut(&page, |data, aux| page::remove_cell(data, layout, aux, i))?;
            idx = i;
        } else if !valid {
            idx = 0;
        } else if res > 0 {
            idx = top.slot;
        } else {
            idx = top.slot + 1;
        }
    }

    let image = fill_in_cell(&mut shared.pager, left_child, key, data)?;
    add_cell(shared, path, idx, image)
}

/// The balance loop: place the cell on the page at the top of `path`,
/// splitting and ascending while it does not fit.
fn add_cell(
    shared: &mut BtShared,
    path: &mut Vec<PathEntry>,
    mut idx: usize,
    mut image: Vec<u8>,
) -> Result<()> {
    let mut level = path.len() - 1;
    loop {
        let page = path[level].page.clone();
        shared.pager.write(&page)?;
        let layout = layout_of(shared.page_size, &page);

        if with_page_mut(&page, |data, aux| {
            page::try_insert_cell(data, layout, aux, idx, &image)
        })? {
            return Ok(());
        }

        if level == 0 {
            return split_root(shared, &page, idx, image);
        }

        // Rotate cells toward a sibling before resorting to a split.
        try_rotate(shared, path, level, &mut idx, image.len())?;
        if with_page_mut(&page, |data, aux| {
            page::try_insert_cell(data, layout, aux, idx, &image)
        })? {
            return Ok(());
        }

        let (divider, parent_idx) = split_page(shared, path, level, idx, &image)?;
        image = divider;
        idx = parent_idx;
        level -= 1;
        path.truncate(level + 1);
    }
}

/// Choose the divider index that minimises the byte difference between the
/// two halves; on a tie the right half keeps the extra bytes.
fn choose_divider(images: &[Vec<u8>]) -> usize {
    let total: usize = images.iter().map(Vec::len).sum();
    let mut best_k = 0;
    let mut best_d = i64::MAX;
    let mut prefix = 0usize;
    for (k, image) in images.iter().enumerate() {
        let left = prefix as i64;
        let right = (total - prefix - image.len()) as i64;
        let d = (left - right).abs();
        if d < best_d {
            best_d = d;
            best_k = k;
        }
        prefix += image.len();
    }
    best_k
}

/// Split the overfull root: the existing cells plus the new one are
/// distributed onto two fresh children and the root keeps one divider.
fn split_root(
    shared: &mut BtShared,
    root: &PageHandle,
    idx: usize,
    image: Vec<u8>,
) -> Result<()> {
    let page_size = shared.page_size;
    let layout = PageLayout::new(page_size);
    let root_pgno = root.borrow().pgno;

    let mut images: Vec<Vec<u8>> = cells_of(root)
        .iter()
        .map(|&off| cell_image(&root.borrow().data, off as usize, page_size))
        .collect();
    images.insert(idx, image);
    let old_rc = right_child_of(root);

    let k = choose_divider(&images);
    let mut divider = images[k].clone();
    let divider_lc = read_u32(&divider, 0);

    let (l_pgno, l_page) = allocate_page(&mut shared.pager)?;
    let (r_pgno, r_page) = allocate_page(&mut shared.pager)?;
    rebuild_page(&l_page, layout, &images[..k], divider_lc)?;
    rebuild_page(&r_page, layout, &images[k + 1..], old_rc)?;

    write_u32(&mut divider, 0, l_pgno);
    rebuild_page(root, layout_of(page_size, root), &[divider], r_pgno)?;
    debug!("btree: split root {root_pgno} into {l_pgno} and {r_pgno}");
    Ok(())
}

/// Split a non-root page: the right half moves to a fresh page, the parent
/// pointer is re-aimed at it, and the divider ascends.
fn split_page(
    shared: &mut BtShared,
    path: &[PathEntry],
    level: usize,
    idx: usize,
    new_image: &[u8],
) -> Result<(Vec<u8>, usize)> {
    let page_size = shared.page_size;
    let layout = PageLayout::new(page_size);
    let p_page = path[level].page.clone();
    let p_pgno = p_page.borrow().pgno;
    let parent = path[level - 1].page.clone();
    let j = path[level - 1].slot;

    let mut images: Vec<Vec<u8>> = cells_of(&p_page)
        .iter()
        .map(|&off| cell_image(&p_page.borrow().data, off as usize, page_size))
        .collect();
    images.insert(idx, new_image.to_vec());
    let old_rc = right_child_of(&p_page);

    let k = choose_divider(&images);
    let mut divider = images[k].clone();
    let divider_lc = read_u32(&divider, 0);

    let (r_pgno, r_page) = allocate_page(&mut shared.pager)?;
    rebuild_page(&p_page, layout, &images[..k], divider_lc)?;
    rebuild_page(&r_page, layout, &images[k + 1..], old_rc)?;

    // The parent slot that covered this page now covers the right half.
    shared.pager.write(&parent)?;
    let parent_layout = layout_of(page_size, &parent);
    with_page_mut(&parent, |data, aux| {
        if j < aux.cells.len() {
            page::set_cell_left_child(data, aux.cells[j] as usize, r_pgno);
        } else {
            page::set_right_child(data, parent_layout, aux, r_pgno);
        }
    })?;

    write_u32(&mut divider, 0, p_pgno);
    trace!("btree: split page {p_pgno}, new right {r_pgno}");
    Ok((divider, j))
}

/// Shift cells toward a sibling until the page can host `cell_len` more
/// bytes, or no legal move remains. `idx` tracks the pending insertion
/// position across moves.
fn try_rotate(
    shared: &mut BtShared,
    path: &[PathEntry],
    level: usize,
    idx: &mut usize,
    cell_len: usize,
) -> Result<()> {
    loop {
        let p_page = path[level].page.clone();
        if free_bytes_of(&p_page) >= cell_len {
            return Ok(());
        }
        let parent = path[level - 1].page.clone();
        let j = path[level - 1].slot;

        if j > 0 && *idx > 0 && rotate_left_once(shared, &parent, j, &p_page, idx)? {
            continue;
        }
        let parent_n = n_cells(&parent);
        let page_n = n_cells(&p_page);
        if j < parent_n
            && *idx < page_n
            && rotate_right_once(shared, &parent, j, &p_page, idx)?
        {
            continue;
        }
        return Ok(());
    }
}

/// Move the page's smallest cell to the left sibling: the old divider
/// drops into the sibling and the moved cell becomes the new divider.
fn rotate_left_once(
    shared: &mut BtShared,
    parent: &PageHandle,
    j: usize,
    p_page: &PageHandle,
    idx: &mut usize,
) -> Result<bool> {
    let page_size = shared.page_size;
    let l_pgno = child_at(parent, j - 1);
    if l_pgno == 0 {
        return Ok(false);
    }
    let l_page = shared.fetch_page(l_pgno)?;

    let d_idx = j - 1;
    let d_off = cell_at(parent, d_idx);
    let d_image = cell_image(&parent.borrow().data, d_off, page_size);
    let s_off = cell_at(p_page, 0);
    let s_image = cell_image(&p_page.borrow().data, s_off, page_size);

    if free_bytes_of(&l_page) < d_image.len() {
        return Ok(false);
    }
    if free_bytes_of(parent) + d_image.len() < s_image.len() {
        return Ok(false);
    }

    shared.pager.write(parent)?;
    shared.pager.write(&l_page)?;
    shared.pager.write(p_page)?;

    // Old divider drops into the left sibling as its largest cell.
    let l_layout = layout_of(page_size, &l_page);
    let l_rc = right_child_of(&l_page);
    let mut dropped = d_image.clone();
    write_u32(&mut dropped, 0, l_rc);
    with_page_mut(&l_page, |data, aux| {
        let at = aux.cells.len();
        if !page::try_insert_cell(data, l_layout, aux, at, &dropped) {
            return false;
        }
        page::set_right_child(data, l_layout, aux, read_u32(&s_image, 0));
        true
    })?
    .then_some(())
    .ok_or_else(|| Error::new(ErrorCode::Internal))?;

    // The moved cell leaves the page and becomes the new divider.
    let p_layout = layout_of(page_size, p_page);
    with_page_mut(p_page, |data, aux| page::remove_cell(data, p_layout, aux, 0))?;

    let parent_layout = layout_of(page_size, parent);
    let mut risen = s_image;
    write_u32(&mut risen, 0, l_pgno);
    with_page_mut(parent, |data, aux| {
        page::remove_cell(data, parent_layout, aux, d_idx);
        page::try_insert_cell(data, parent_layout, aux, d_idx, &risen)
    })?
    .then_some(())
    .ok_or_else(|| Error::new(ErrorCode::Internal))?;

    *idx -= 1;
    Ok(true)
}

/// Move the page's largest cell to the right sibling, mirror of
/// [`rotate_left_once`].
fn rotate_right_once(
    shared: &mut BtShared,
    parent: &PageHandle,
    j: usize,
    p_page: &PageHandle,
    idx: &mut usize,
) -> Result<bool> {
    let page_size = shared.page_size;
    let r_pgno = child_at(parent, j + 1);
    if r_pgno == 0 {
        return Ok(false);
    }
    let r_page = shared.fetch_page(r_pgno)?;

    let d_off = cell_at(parent, j);
    let d_image = cell_image(&parent.borrow().data, d_off, page_size);
    let m = n_cells(p_page);
    let s_off = cell_at(p_page, m - 1);
    let s_image = cell_image(&p_page.borrow().data, s_off, page_size);

    if free_bytes_of(&r_page) < d_image.len() {
        return Ok(false);
    }
    if free_bytes_of(parent) + d_image.len() < s_image.len() {
        return Ok(false);
    }

    shared.pager.write(parent)?;
    shared.pager.write(&r_page)?;
    shared.pager.write(p_page)?;

    // Old divider drops into the right sibling as its smallest cell; the
    // page's old rightmost subtree becomes its left child.
    let r_layout = layout_of(page_size, &r_page);
    let p_rc = right_child_of(p_page);
    let mut dropped = d_image.clone();
    write_u32(&mut dropped, 0, p_rc);
    with_page_mut(&r_page, |data, aux| {
        page::try_insert_cell(data, r_layout, aux, 0, &dropped)
    })?
    .then_some(())
    .ok_or_else(|| Error::new(ErrorCode::Internal))?;

    let p_pgno = p_page.borrow().pgno;
    let p_layout = layout_of(page_size, p_page);
    with_page_mut(p_page, |data, aux| {
        page::set_right_child(data, p_layout, aux, read_u32(&s_image, 0));
        page::remove_cell(data, p_layout, aux, m - 1);
    })?;

    let parent_layout = layout_of(page_size, parent);
    let mut risen = s_image;
    write_u32(&mut risen, 0, p_pgno);
    with_page_mut(parent, |data, aux| {
        page::remove_cell(data, parent_layout, aux, j);
        page::try_insert_cell(data, parent_layout, aux, j, &risen)
    })?
    .then_some(())
    .ok_or_else(|| Error::new(ErrorCode::Internal))?;

    Ok(true)
}

// ============================================================================
// Delete
// ============================================================================

/// Remove the cell the path rests on. Interior cells are replaced in place
/// by their in-order successor; a page emptied by the removal is freed and
/// the parent pointer collapsed.
pub(crate) fn delete_at(shared: &mut BtShared, path: &mut Vec<PathEntry>) -> Result<()> {
    let level = path.len() - 1;
    let p_page = path[level].page.clone();
    let i = path[level].slot;
    let off = cell_at(&p_page, i);
    let lc = cell_left_child(&p_page.borrow().data, off);
    let p_layout = layout_of(shared.page_size, &p_page);

    shared.pager.write(&p_page)?;

    if lc == 0 {
        clear_cell_overflow(&mut shared.pager, &p_page, off)?;
        with_page_mut(&p_page, |data, aux| page::remove_cell(data, p_layout, aux, i))?;
        return collapse_if_empty(shared, path);
    }

    let n = n_cells(&p_page);
    let next_child = if i + 1 < n {
        child_at(&p_page, i + 1)
    } else {
        right_child_of(&p_page)
    };

    if next_child == 0 {
        // No subtree between this cell and its successor: the orphaned
        // left child re-attaches to the vacated slot.
        clear_cell_overflow(&mut shared.pager, &p_page, off)?;
        with_page_mut(&p_page, |data, aux| {
            page::remove_cell(data, p_layout, aux, i);
            if i < aux.cells.len() {
                page::set_cell_left_child(data, aux.cells[i] as usize, lc);
            } else {
                page::set_right_child(data, p_layout, aux, lc);
            }
        })?;
        return collapse_if_empty(shared, path);
    }

    // Pull up the in-order successor: the smallest leaf cell of the next
    // subtree. Its overflow chain transfers intact with the image.
    path[level].slot = i + 1;
    if !descend_to_min(shared, path, next_child)? {
        return Err(Error::with_message(ErrorCode::Corrupt, "empty subtree"));
    }
    let q_page = path
        .last()
        .ok_or_else(|| Error::new(ErrorCode::Internal))?
        .page
        .clone();
    let s_off = cell_at(&q_page, 0);
    let s_image = cell_image(&q_page.borrow().data, s_off, shared.page_size);
    let q_layout = layout_of(shared.page_size, &q_page);
    shared.pager.write(&q_page)?;
    with_page_mut(&q_page, |data, aux| page::remove_cell(data, q_layout, aux, 0))?;
    collapse_if_empty(shared, path)?;

    path.truncate(level + 1);
    path[level].slot = i;
    clear_cell_overflow(&mut shared.pager, &p_page, off)?;
    with_page_mut(&p_page, |data, aux| page::remove_cell(data, p_layout, aux, i))?;

    let mut replacement = s_image;
    write_u32(&mut replacement, 0, lc);
    add_cell(shared, path, i, replacement)
}

/// Free the page at the top of the path if the removal emptied it,
/// collapsing the parent's pointer; an emptied root pulls its lone child's
/// content up instead.
fn collapse_if_empty(shared: &mut BtShared, path: &mut Vec<PathEntry>) -> Result<()> {
    let page = path
        .last()
        .ok_or_else(|| Error::new(ErrorCode::Internal))?
        .page
        .clone();
    if n_cells(&page) > 0 {
        return Ok(());
    }

    if path.len() == 1 {
        // The root cannot be freed; shallow the tree instead.
        loop {
            let rc = right_child_of(&page);
            if rc == 0 || n_cells(&page) > 0 {
                return Ok(());
            }
            let child = shared.fetch_page(rc)?;
            let images: Vec<Vec<u8>> = cells_of(&child)
                .iter()
                .map(|&off| cell_image(&child.borrow().data, off as usize, shared.page_size))
                .collect();
            let child_rc = right_child_of(&child);
            shared.pager.write(&page)?;
            rebuild_page(&page, layout_of(shared.page_size, &page), &images, child_rc)?;
            drop(child);
            free_page(&mut shared.pager, rc)?;
        }
    }

    let pgno = page.borrow().pgno;
    let rc = right_child_of(&page);
    path.pop();
    let parent = path
        .last()
        .ok_or_else(|| Error::new(ErrorCode::Internal))?;
    let pp = parent.page.clone();
    let j = parent.slot;
    let pp_layout = layout_of(shared.page_size, &pp);
    shared.pager.write(&pp)?;
    with_page_mut(&pp, |data, aux| {
        if j < aux.cells.len() {
            page::set_cell_left_child(data, aux.cells[j] as usize, rc);
        } else {
            page::set_right_child(data, pp_layout, aux, rc);
        }
    })?;
    drop(page);
    free_page(&mut shared.pager, pgno)?;
    trace!("btree: collapsed empty page {pgno}");
    Ok(())
}

// ============================================================================
// Table bookkeeping
// ============================================================================

fn lookup_table(shared: &mut BtShared, key: &str) -> Result<Option<Pgno>> {
    if shared.pager.page_count() < MASTER_ROOT {
        return Ok(None);
    }
    let (path, res, valid) = seek(shared, MASTER_ROOT, key.as_bytes())?;
    if res != 0 || !valid {
        return Ok(None);
    }
    let top = path
        .last()
        .ok_or_else(|| Error::new(ErrorCode::Internal))?;
    let off = cell_at(&top.page, top.slot);
    let (n_key, n_data) = {
        let hdr = top.page.borrow();
        (cell_key_size(&hdr.data, off), cell_data_size(&hdr.data, off))
    };
    if n_data != 4 {
        return Err(Error::with_message(ErrorCode::Corrupt, "bad table entry"));
    }
    let bytes = read_payload(&mut shared.pager, &top.page, off, n_key, 4)?;
    Ok(Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
}

/// Free a whole subtree: child pages, overflow chains, and (optionally)
/// the page itself, which is otherwise reset to an empty leaf.
fn clear_subtree(shared: &mut BtShared, pgno: Pgno, free_this: bool) -> Result<()> {
    let page = shared.fetch_page(pgno)?;
    let mut children = Vec::new();
    let mut chains = Vec::new();
    {
        let hdr = page.borrow();
        let aux = hdr
            .aux
            .as_ref()
            .ok_or_else(|| Error::new(ErrorCode::Internal))?;
        for &off in &aux.cells {
            let off = off as usize;
            let lc = cell_left_child(&hdr.data, off);
            if lc != 0 {
                children.push(lc);
            }
            let ovfl = cell_overflow(&hdr.data, off, shared.page_size);
            if ovfl != 0 {
                chains.push(ovfl);
            }
        }
        if aux.right_child != 0 {
            children.push(aux.right_child);
        }
    }
    for chain in chains {
        clear_overflow(&mut shared.pager, chain)?;
    }
    for child in children {
        clear_subtree(shared, child, true)?;
    }
    if free_this {
        drop(page);
        free_page(&mut shared.pager, pgno)?;
    } else {
        shared.pager.write(&page)?;
        let layout = layout_of(shared.page_size, &page);
        let mut hdr = page.borrow_mut();
        let PgHdr {
            ref mut data,
            ref mut aux,
            ..
        } = *hdr;
        *aux = Some(page::init_page(data, layout));
    }
    Ok(())
}

fn new_db(shared: &mut BtShared) -> Result<()> {
    let page1 = shared.pager.allocate()?;
    {
        let mut hdr = page1.borrow_mut();
        let PgHdr {
            ref mut data,
            ref mut aux,
            ..
        } = *hdr;
        let new_aux = page::init_page(data, PageLayout::for_page1(shared.page_size));
        write_magic(data);
        write_freelist_head(data, 0);
        *aux = Some(new_aux);
    }
    let master = shared.pager.allocate()?;
    {
        let mut hdr = master.borrow_mut();
        let PgHdr {
            ref mut data,
            ref mut aux,
            ..
        } = *hdr;
        *aux = Some(page::init_page(data, PageLayout::new(shared.page_size)));
    }
    debug!("btree: initialised new database");
    Ok(())
}

// ============================================================================
// Handle
// ============================================================================

/// A database handle: one open B-tree file.
pub struct Btree {
    pub(crate) shared: Rc<RefCell<BtShared>>,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree").finish_non_exhaustive()
    }
}

impl Btree {
    /// Open a database file with default configuration, creating it if
    /// absent.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_config(path, BtreeConfig::default())
    }

    /// Open with explicit configuration.
    pub fn open_with_config(path: &str, config: BtreeConfig) -> Result<Self> {
        Self::open_inner(path, config, None)
    }

    /// Open with a client-supplied key order. The comparator sees fully
    /// materialised keys; the default order is bytewise and streams
    /// overflow pages only as far as a decision requires.
    pub fn open_with_comparator(
        path: &str,
        config: BtreeConfig,
        comparator: KeyCompare,
    ) -> Result<Self> {
        Self::open_inner(path, config, Some(comparator))
    }

    fn open_inner(
        path: &str,
        config: BtreeConfig,
        comparator: Option<KeyCompare>,
    ) -> Result<Self> {
        if !config.page_size.is_power_of_two()
            || config.page_size < MIN_PAGE_SIZE
            || config.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::with_message(ErrorCode::Error, "bad page size"));
        }
        let vfs = vfs_find(None)?;
        let mut pager = Pager::open(&vfs, path, config.page_size, config.cache_pages)?;

        if pager.page_count() > 0 {
            if pager.page_count() < MASTER_ROOT {
                return Err(Error::with_message(ErrorCode::Corrupt, "truncated database"));
            }
            let page1 = pager.get(1)?;
            let magic = read_magic(&page1.borrow().data);
            if magic != (page::MAGIC_1, page::MAGIC_2) {
                return Err(Error::with_message(ErrorCode::Corrupt, "bad magic words"));
            }
        }

        Ok(Self {
            shared: Rc::new(RefCell::new(BtShared {
                pager,
                page_size: config.page_size,
                in_trans: TransState::None,
                gen: 0,
                open_cursors: Vec::new(),
                next_cursor_id: 1,
                closed: false,
                comparator,
            })),
        })
    }

    /// Begin a transaction. A write transaction stamps the file header on
    /// a fresh database and refuses to start while cursors are open.
    pub fn begin_trans(&self, write: bool) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        if !write {
            shared.pager.shared_lock()?;
            if shared.in_trans == TransState::None {
                shared.in_trans = TransState::Read;
            }
            return Ok(());
        }
        if shared.in_trans == TransState::Write {
            return Ok(());
        }
        if !shared.open_cursors.is_empty() {
            return Err(Error::with_message(
                ErrorCode::Error,
                "cannot begin write transaction with cursors open",
            ));
        }
        shared.pager.begin()?;
        shared.in_trans = TransState::Write;
        if shared.pager.page_count() == 0 {
            new_db(&mut shared)?;
        } else {
            let page1 = shared.pager.get(1)?;
            shared.pager.write(&page1)?;
        }
        Ok(())
    }

    /// Durably end the current transaction.
    pub fn commit(&self) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        if !shared.open_cursors.is_empty() {
            return Err(Error::with_message(ErrorCode::Error, "cursors still open"));
        }
        shared.pager.commit()?;
        shared.in_trans = TransState::None;
        shared.gen += 1;
        Ok(())
    }

    /// Discard the current transaction.
    pub fn rollback(&self) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        if !shared.open_cursors.is_empty() {
            return Err(Error::with_message(ErrorCode::Error, "cursors still open"));
        }
        shared.pager.rollback()?;
        shared.in_trans = TransState::None;
        shared.gen += 1;
        Ok(())
    }

    /// Current transaction state.
    pub fn txn_state(&self) -> TransState {
        self.shared.borrow().in_trans
    }

    /// Current file length in pages.
    pub fn page_count(&self) -> Pgno {
        self.shared.borrow().pager.page_count()
    }

    /// Open a cursor against the table rooted at `root`. Opening the first
    /// cursor takes the read lock.
    pub fn cursor(&self, root: Pgno) -> Result<BtCursor> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        if root < MASTER_ROOT {
            return Err(Error::with_message(ErrorCode::Error, "bad root page"));
        }
        shared.pager.shared_lock()?;
        let id = shared.next_cursor_id;
        shared.next_cursor_id += 1;
        shared.open_cursors.push(id);
        let gen = shared.gen;
        drop(shared);
        Ok(BtCursor::new(Rc::clone(&self.shared), id, root, gen))
    }

    /// Create a named table and return its root page. Requires a write
    /// transaction; the name is folded to lowercase.
    pub fn create_table(&self, name: &str) -> Result<Pgno> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        shared.require_write()?;
        let key = name.to_lowercase();
        if lookup_table(&mut shared, &key)?.is_some() {
            return Err(Error::with_message(ErrorCode::Error, "table exists"));
        }
        let (root, page) = allocate_page(&mut shared.pager)?;
        {
            let layout = PageLayout::new(shared.page_size);
            let mut hdr = page.borrow_mut();
            let PgHdr {
                ref mut data,
                ref mut aux,
                ..
            } = *hdr;
            *aux = Some(page::init_page(data, layout));
        }
        let (mut path, res, valid) = seek(&mut shared, MASTER_ROOT, key.as_bytes())?;
        insert_at(
            &mut shared,
            &mut path,
            res,
            valid,
            key.as_bytes(),
            &root.to_le_bytes(),
        )?;
        shared.gen += 1;
        debug!("btree: created table {key:?} at root {root}");
        Ok(root)
    }

    /// Look up a named table's root page.
    pub fn table_root(&self, name: &str) -> Result<Option<Pgno>> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        shared.pager.shared_lock()?;
        lookup_table(&mut shared, &name.to_lowercase())
    }

    /// Delete every entry of the table rooted at `root`, keeping the root.
    pub fn clear_table(&self, root: Pgno) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        shared.require_write()?;
        clear_subtree(&mut shared, root, false)?;
        shared.gen += 1;
        Ok(())
    }

    /// Drop a named table: clear it, free its root, remove its entry.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        shared.require_write()?;
        let key = name.to_lowercase();
        let root = lookup_table(&mut shared, &key)?
            .ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        clear_subtree(&mut shared, root, true)?;
        let (mut path, res, valid) = seek(&mut shared, MASTER_ROOT, key.as_bytes())?;
        if res == 0 && valid {
            delete_at(&mut shared, &mut path)?;
        }
        shared.gen += 1;
        Ok(())
    }

    /// Close the handle, rolling back any open write transaction. Cursors
    /// still alive see every further operation fail.
    pub fn close(self) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            return Ok(());
        }
        if shared.in_trans == TransState::Write {
            shared.pager.rollback()?;
        }
        shared.in_trans = TransState::None;
        shared.closed = true;
        shared.gen += 1;
        Ok(())
    }

    /// Verify the structural invariants of every table and the free list:
    /// per-page byte accounting, in-page key order, child key-range
    /// containment, and that reachable pages and free pages partition
    /// `[1, pagecount]`.
    pub fn integrity_check(&self) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        let n_page = shared.pager.page_count();
        if n_page == 0 {
            return Ok(());
        }

        let page1 = shared.pager.get(1)?;
        if read_magic(&page1.borrow().data) != (page::MAGIC_1, page::MAGIC_2) {
            return Err(Error::with_message(ErrorCode::Corrupt, "bad magic words"));
        }

        let mut seen = vec![false; n_page as usize + 1];
        seen[1] = true;

        check_subtree(&mut shared, MASTER_ROOT, None, None, &mut seen)?;

        let mut entries = Vec::new();
        collect_entries(&mut shared, MASTER_ROOT, &mut entries)?;
        for (name, root_bytes) in entries {
            if root_bytes.len() != 4 {
                return Err(Error::with_message(ErrorCode::Corrupt, "bad table entry"));
            }
            let root = u32::from_le_bytes([
                root_bytes[0],
                root_bytes[1],
                root_bytes[2],
                root_bytes[3],
            ]);
            trace!("integrity: checking table {:?} at {root}", String::from_utf8_lossy(&name));
            check_subtree(&mut shared, root, None, None, &mut seen)?;
        }

        // Free-list pages must be unreachable from every table.
        let head = read_freelist_head(&page1.borrow().data);
        let mut pgno = head;
        while pgno != 0 {
            if pgno > n_page || seen[pgno as usize] {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "free list overlaps live pages",
                ));
            }
            seen[pgno as usize] = true;
            let page = shared.pager.get(pgno)?;
            let next = read_u32(&page.borrow().data, 0);
            pgno = next;
        }

        for p in 1..=n_page {
            if !seen[p as usize] {
                return Err(Error::with_message(ErrorCode::Corrupt, "unreachable page"));
            }
        }
        Ok(())
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            if !shared.closed && shared.in_trans == TransState::Write {
                let _ = shared.pager.rollback();
            }
            shared.closed = true;
        }
    }
}

/// Recursive structural walk for [`Btree::integrity_check`].
fn check_subtree(
    shared: &mut BtShared,
    pgno: Pgno,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    seen: &mut [bool],
) -> Result<()> {
    let n_page = shared.pager.page_count();
    if pgno < MASTER_ROOT || pgno > n_page {
        return Err(Error::with_message(ErrorCode::Corrupt, "child out of range"));
    }
    if seen[pgno as usize] {
        return Err(Error::with_message(ErrorCode::Corrupt, "page reachable twice"));
    }
    seen[pgno as usize] = true;

    let page = shared.fetch_page(pgno)?;
    let cells = cells_of(&page);
    let right_child = right_child_of(&page);

    let mut bound = lower;
    for &off in &cells {
        let off = off as usize;
        let key = read_full_key(&mut shared.pager, &page, off)?;
        if let Some(ref low) = bound {
            if shared.order_keys(low, &key) != Ordering::Less {
                return Err(Error::with_message(ErrorCode::Corrupt, "keys out of order"));
            }
        }
        if let Some(ref high) = upper {
            if shared.order_keys(&key, high) != Ordering::Less {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "key outside subtree range",
                ));
            }
        }

        // Overflow pages are reachable too.
        let (n_payload, ovfl) = {
            let hdr = page.borrow();
            (
                cell_payload_size(&hdr.data, off),
                cell_overflow(&hdr.data, off, shared.page_size),
            )
        };
        let local = local_payload(n_payload, shared.page_size);
        if n_payload > local {
            let body = ovfl_body(shared.page_size);
            let mut remaining = n_payload - local;
            let mut chain = ovfl;
            while remaining > 0 {
                if chain == 0 || chain > n_page {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        "overflow chain too short",
                    ));
                }
                if seen[chain as usize] {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        "overflow page reachable twice",
                    ));
                }
                seen[chain as usize] = true;
                let ovfl_page = shared.pager.get(chain)?;
                chain = read_u32(&ovfl_page.borrow().data, 0);
                remaining = remaining.saturating_sub(body);
            }
            if chain != 0 {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "overflow chain too long",
                ));
            }
        }

        let lc = cell_left_child(&page.borrow().data, off);
        if lc != 0 {
            check_subtree(shared, lc, bound.clone(), Some(key.clone()), seen)?;
        }
        bound = Some(key);
    }

    if right_child != 0 {
        check_subtree(shared, right_child, bound, upper, seen)?;
    }
    Ok(())
}

/// In-order (key, data) listing of a subtree.
fn collect_entries(
    shared: &mut BtShared,
    pgno: Pgno,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    let page = shared.fetch_page(pgno)?;
    let cells = cells_of(&page);
    for &off in &cells {
        let off = off as usize;
        let lc = cell_left_child(&page.borrow().data, off);
        if lc != 0 {
            collect_entries(shared, lc, out)?;
        }
        let (n_key, n_data) = {
            let hdr = page.borrow();
            (cell_key_size(&hdr.data, off), cell_data_size(&hdr.data, off))
        };
        let key = read_payload(&mut shared.pager, &page, off, 0, n_key)?;
        let data = read_payload(&mut shared.pager, &page, off, n_key, n_data)?;
        out.push((key, data));
    }
    let rc = right_child_of(&page);
    if rc != 0 {
        collect_entries(shared, rc, out)?;
    }
    Ok(())
}
