//! Page cache management
//!
//! The pager sits between the B-tree and the VFS: it materialises pages on
//! first fetch, tracks pins and dirty state, keeps before-images for the
//! current write transaction, and makes commit/rollback atomic with respect
//! to this process. Pins are `Rc` clones of the page handle; a page whose
//! only owner is the cache is unpinned and may be evicted once clean.
//!
//! The B-tree scope is single-threaded, so pages are `Rc<RefCell<..>>`
//! rather than shared-memory structures. Crash recovery beyond rollback is
//! out of scope here; the journal is process-local and durability comes
//! from write-back plus fsync at commit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::storage::page::PageAux;
use crate::types::{DbOffset, Pgno};

// ============================================================================
// Page header
// ============================================================================

/// One cached page. `aux` caches the lazily decoded B-tree view; it is
/// dropped on eviction and rollback, which is what makes decoding lazy.
pub struct PgHdr {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub aux: Option<PageAux>,
}

/// A pinned page. Dropping the last clone outside the cache unpins it.
pub type PageHandle = Rc<RefCell<PgHdr>>;

// ============================================================================
// Pager state
// ============================================================================

/// Pager lock-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PagerState {
    /// No lock held
    Open,
    /// Read lock held
    Reader,
    /// Write transaction in progress
    Writer,
}

// ============================================================================
// Pager
// ============================================================================

pub struct Pager {
    file: Box<dyn VfsFile>,
    pub page_size: usize,
    cache_pages: usize,
    state: PagerState,
    /// Logical page count, including pages created this transaction.
    n_page: Pgno,
    /// Page count at the start of the write transaction.
    orig_n_page: Pgno,
    cache: HashMap<Pgno, PageHandle>,
    /// Before-images for the write transaction. `None` marks a page that
    /// did not exist when the transaction began.
    journal: HashMap<Pgno, Option<Vec<u8>>>,
}

impl Pager {
    /// Open a database file, creating it if absent.
    pub fn open(
        vfs: &Arc<dyn Vfs>,
        path: &str,
        page_size: usize,
        cache_pages: usize,
    ) -> Result<Self> {
        let file = vfs.open(
            Some(path),
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB,
        )?;
        let size = file.file_size()?;
        if size % page_size as DbOffset != 0 {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "file size not a page multiple",
            ));
        }
        let n_page = (size / page_size as DbOffset) as Pgno;
        Ok(Self {
            file,
            page_size,
            cache_pages: cache_pages.max(8),
            state: PagerState::Open,
            n_page,
            orig_n_page: n_page,
            cache: HashMap::new(),
            journal: HashMap::new(),
        })
    }

    /// Current file length in pages, including pages created this
    /// transaction.
    pub fn page_count(&self) -> Pgno {
        self.n_page
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Take the read lock.
    pub fn shared_lock(&mut self) -> Result<()> {
        if self.state == PagerState::Open {
            self.state = PagerState::Reader;
        }
        Ok(())
    }

    /// Release all locks outside a write transaction.
    pub fn unlock(&mut self) {
        if self.state == PagerState::Reader {
            self.state = PagerState::Open;
        }
    }

    /// Start a write transaction.
    pub fn begin(&mut self) -> Result<()> {
        if self.state == PagerState::Writer {
            return Ok(());
        }
        self.state = PagerState::Writer;
        self.orig_n_page = self.n_page;
        debug!("pager: begin write txn, {} pages", self.n_page);
        Ok(())
    }

    /// Fetch a page, pinning it. The page is read from disk on a cache
    /// miss; bytes past end-of-file read as zero.
    pub fn get(&mut self, pgno: Pgno) -> Result<PageHandle> {
        if pgno == 0 {
            return Err(Error::with_message(ErrorCode::Internal, "page zero fetch"));
        }
        if pgno > self.n_page {
            return Err(Error::with_message(ErrorCode::Corrupt, "page out of range"));
        }
        if let Some(page) = self.cache.get(&pgno) {
            return Ok(Rc::clone(page));
        }

        let mut data = vec![0u8; self.page_size];
        let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
        self.file.read(&mut data, offset)?;

        let page = Rc::new(RefCell::new(PgHdr {
            pgno,
            data,
            dirty: false,
            aux: None,
        }));
        self.cache.insert(pgno, Rc::clone(&page));
        self.trim_cache();
        Ok(page)
    }

    /// Return the page only if it is already cached; no I/O.
    pub fn lookup(&self, pgno: Pgno) -> Option<PageHandle> {
        self.cache.get(&pgno).map(Rc::clone)
    }

    /// Mark a page writable: record its before-image and set it dirty.
    /// Must be called before the page bytes are modified.
    pub fn write(&mut self, page: &PageHandle) -> Result<()> {
        if self.state != PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::Error,
                "write outside transaction",
            ));
        }
        let mut hdr = page.borrow_mut();
        self.journal
            .entry(hdr.pgno)
            .or_insert_with(|| Some(hdr.data.clone()));
        hdr.dirty = true;
        Ok(())
    }

    /// Extend the file by one page and return it pinned, zeroed, dirty.
    pub fn allocate(&mut self) -> Result<PageHandle> {
        if self.state != PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::Error,
                "allocate outside transaction",
            ));
        }
        self.n_page += 1;
        let pgno = self.n_page;
        let page = Rc::new(RefCell::new(PgHdr {
            pgno,
            data: vec![0u8; self.page_size],
            dirty: true,
            aux: None,
        }));
        self.journal.insert(pgno, None);
        self.cache.insert(pgno, Rc::clone(&page));
        trace!("pager: extend file to page {pgno}");
        Ok(page)
    }

    /// Durable end of the write transaction: write back every dirty page,
    /// sync, and discard the journal.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != PagerState::Writer {
            self.unlock();
            return Ok(());
        }
        let mut n_written = 0usize;
        for (&pgno, page) in &self.cache {
            let mut hdr = page.borrow_mut();
            if !hdr.dirty {
                continue;
            }
            let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
            self.file.write(&hdr.data, offset)?;
            hdr.dirty = false;
            n_written += 1;
        }
        self.file.sync(SyncFlags::NORMAL)?;
        self.journal.clear();
        self.orig_n_page = self.n_page;
        self.state = PagerState::Open;
        debug!("pager: commit, {n_written} pages written");
        Ok(())
    }

    /// Discard the write transaction: restore before-images, drop pages
    /// created inside the transaction, reset the page count.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != PagerState::Writer {
            self.unlock();
            return Ok(());
        }
        for (pgno, image) in std::mem::take(&mut self.journal) {
            match image {
                Some(bytes) => {
                    if let Some(page) = self.cache.get(&pgno) {
                        let mut hdr = page.borrow_mut();
                        hdr.data = bytes;
                        hdr.dirty = false;
                        hdr.aux = None;
                    }
                }
                None => {
                    self.cache.remove(&pgno);
                }
            }
        }
        self.n_page = self.orig_n_page;
        self.state = PagerState::Open;
        debug!("pager: rollback to {} pages", self.n_page);
        Ok(())
    }

    /// Evict clean, unpinned pages once the cache exceeds its budget.
    fn trim_cache(&mut self) {
        if self.cache.len() <= self.cache_pages {
            return;
        }
        let excess = self.cache.len() - self.cache_pages;
        let victims: Vec<Pgno> = self
            .cache
            .iter()
            .filter(|(_, page)| Rc::strong_count(page) == 1 && !page.borrow().dirty)
            .map(|(&pgno, _)| pgno)
            .take(excess)
            .collect();
        for pgno in victims {
            self.cache.remove(&pgno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::vfs_find;

    fn open_pager(path: &std::path::Path) -> Pager {
        let vfs = vfs_find(None).unwrap();
        Pager::open(&vfs, path.to_str().unwrap(), 1024, 16).unwrap()
    }

    #[test]
    fn test_commit_persists_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        {
            let mut pager = open_pager(&path);
            pager.begin().unwrap();
            let page = pager.allocate().unwrap();
            page.borrow_mut().data[0..4].copy_from_slice(b"page");
            pager.write(&page).unwrap();
            let page2 = pager.allocate().unwrap();
            page2.borrow_mut().data[0..3].copy_from_slice(b"two");
            pager.commit().unwrap();
            assert_eq!(pager.page_count(), 2);
        }
        let mut pager = open_pager(&path);
        assert_eq!(pager.page_count(), 2);
        let page = pager.get(1).unwrap();
        assert_eq!(&page.borrow().data[0..4], b"page");
        let page2 = pager.get(2).unwrap();
        assert_eq!(&page2.borrow().data[0..3], b"two");
    }

    #[test]
    fn test_rollback_restores_images_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let mut pager = open_pager(&path);

        pager.begin().unwrap();
        let page = pager.allocate().unwrap();
        page.borrow_mut().data[0] = 0xaa;
        pager.commit().unwrap();

        pager.begin().unwrap();
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.borrow_mut().data[0] = 0xbb;
        let extra = pager.allocate().unwrap();
        drop(extra);
        assert_eq!(pager.page_count(), 2);
        pager.rollback().unwrap();

        assert_eq!(pager.page_count(), 1);
        let page = pager.get(1).unwrap();
        assert_eq!(page.borrow().data[0], 0xaa);
        assert!(pager.get(2).is_err());
    }

    #[test]
    fn test_write_requires_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let mut pager = open_pager(&path);
        pager.begin().unwrap();
        pager.allocate().unwrap();
        pager.commit().unwrap();

        let page = pager.get(1).unwrap();
        assert_eq!(pager.write(&page).unwrap_err().code(), ErrorCode::Error);
    }

    #[test]
    fn test_lookup_does_no_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let mut pager = open_pager(&path);
        pager.begin().unwrap();
        pager.allocate().unwrap();
        pager.commit().unwrap();

        assert!(pager.lookup(1).is_none());
        let _page = pager.get(1).unwrap();
        assert!(pager.lookup(1).is_some());
    }

    #[test]
    fn test_cache_trim_spares_pinned_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pager.db");
        let mut pager = open_pager(&path);
        pager.begin().unwrap();
        for _ in 0..40 {
            pager.allocate().unwrap();
        }
        pager.commit().unwrap();

        let pinned = pager.get(1).unwrap();
        for pgno in 2..=40 {
            pager.get(pgno).unwrap();
        }
        // The pinned page survived the trims.
        assert!(pager.lookup(1).is_some());
        assert_eq!(pinned.borrow().pgno, 1);
    }
}
