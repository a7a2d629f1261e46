//! B-tree cursors
//!
//! A cursor is a positioned iterator over one table. Its position is the
//! root-to-leaf path it descended, each level holding a pinned page handle
//! plus the slot taken; in-order stepping is therefore a stack walk, never
//! a fresh root-down search. Cursors are invalidated by commit, rollback,
//! and structural changes made through other cursors; `moveto`, `first`
//! and `last` re-validate.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::payload::{read_full_key, read_payload};
use crate::storage::btree::{
    cell_at, cells_of, delete_at, descend_to_max, descend_to_min, insert_at, n_cells,
    right_child_of, seek, BtShared, PathEntry, TransState,
};
use crate::storage::page::{cell_data_size, cell_key_size, cell_left_child};
use crate::types::Pgno;

/// A cursor over one table of an open database.
pub struct BtCursor {
    shared: Rc<RefCell<BtShared>>,
    id: u64,
    root: Pgno,
    path: Vec<PathEntry>,
    valid: bool,
    /// Set after `delete` so the next advance is a no-op.
    skip_next: bool,
    gen: u64,
}

impl BtCursor {
    pub(crate) fn new(shared: Rc<RefCell<BtShared>>, id: u64, root: Pgno, gen: u64) -> Self {
        Self {
            shared,
            id,
            root,
            path: Vec::new(),
            valid: false,
            skip_next: false,
            gen,
        }
    }

    /// Root page of the table this cursor walks.
    pub fn root(&self) -> Pgno {
        self.root
    }

    /// Whether the cursor rests on an entry.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn check_gen(&self, shared: &BtShared) -> Result<()> {
        if self.gen != shared.gen {
            return Err(Error::with_message(
                ErrorCode::Abort,
                "cursor invalidated by a structural change",
            ));
        }
        Ok(())
    }

    fn require_valid(&self) -> Result<()> {
        if !self.valid {
            return Err(Error::with_message(
                ErrorCode::Error,
                "cursor not on an entry",
            ));
        }
        Ok(())
    }

    /// Seek to `key`. Lands on the equal entry, otherwise on the smallest
    /// greater or largest lesser one; the returned sign compares the
    /// landed-on entry against the key. An empty table yields +1 with no
    /// valid entry.
    pub fn moveto(&mut self, key: &[u8]) -> Result<i32> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.skip_next = false;
        self.gen = shared.gen;
        self.path.clear();
        if shared.pager.page_count() == 0 {
            self.valid = false;
            return Ok(1);
        }
        let (path, res, valid) = seek(&mut shared, self.root, key)?;
        self.path = path;
        self.valid = valid;
        Ok(res)
    }

    /// Position on the smallest entry. Returns false on an empty table.
    pub fn first(&mut self) -> Result<bool> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.skip_next = false;
        self.gen = shared.gen;
        self.path.clear();
        if shared.pager.page_count() == 0 {
            self.valid = false;
            return Ok(false);
        }
        self.valid = descend_to_min(&mut shared, &mut self.path, self.root)?;
        Ok(self.valid)
    }

    /// Position on the largest entry. Returns false on an empty table.
    pub fn last(&mut self) -> Result<bool> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.skip_next = false;
        self.gen = shared.gen;
        self.path.clear();
        if shared.pager.page_count() == 0 {
            self.valid = false;
            return Ok(false);
        }
        self.valid = descend_to_max(&mut shared, &mut self.path, self.root)?;
        Ok(self.valid)
    }

    /// Advance to the in-order successor. Returns false at end.
    pub fn next(&mut self) -> Result<bool> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.check_gen(&shared)?;
        if self.skip_next {
            self.skip_next = false;
            return Ok(self.valid);
        }
        if !self.valid {
            return Ok(false);
        }

        let (page, i) = {
            let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
            (top.page.clone(), top.slot)
        };
        let cells = cells_of(&page);
        let child = if i + 1 < cells.len() {
            cell_left_child(&page.borrow().data, cells[i + 1] as usize)
        } else {
            right_child_of(&page)
        };

        if child != 0 {
            if let Some(top) = self.path.last_mut() {
                top.slot = i + 1;
            }
            self.valid = descend_to_min(&mut shared, &mut self.path, child)?;
            return Ok(self.valid);
        }
        if i + 1 < cells.len() {
            if let Some(top) = self.path.last_mut() {
                top.slot = i + 1;
            }
            return Ok(true);
        }
        // Past the end of this page: ascend until a pending cell appears.
        loop {
            self.path.pop();
            let entry = match self.path.last() {
                Some(entry) => entry,
                None => {
                    self.valid = false;
                    return Ok(false);
                }
            };
            if entry.slot < n_cells(&entry.page) {
                return Ok(true);
            }
        }
    }

    /// Step to the in-order predecessor. Returns false at the beginning.
    pub fn prev(&mut self) -> Result<bool> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.check_gen(&shared)?;
        self.skip_next = false;
        if !self.valid {
            return Ok(false);
        }

        let (page, i) = {
            let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
            (top.page.clone(), top.slot)
        };
        let off = cell_at(&page, i);
        let lc = cell_left_child(&page.borrow().data, off);

        if lc != 0 {
            self.valid = descend_to_max(&mut shared, &mut self.path, lc)?;
            return Ok(self.valid);
        }
        if i > 0 {
            if let Some(top) = self.path.last_mut() {
                top.slot = i - 1;
            }
            return Ok(true);
        }
        loop {
            self.path.pop();
            match self.path.last_mut() {
                Some(entry) if entry.slot > 0 => {
                    entry.slot -= 1;
                    return Ok(true);
                }
                Some(_) => continue,
                None => {
                    self.valid = false;
                    return Ok(false);
                }
            }
        }
    }

    /// Size in bytes of the current entry's key.
    pub fn key_size(&self) -> Result<usize> {
        let shared = self.shared.borrow();
        shared.check_open()?;
        self.check_gen(&shared)?;
        self.require_valid()?;
        let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let off = cell_at(&top.page, top.slot);
        Ok(cell_key_size(&top.page.borrow().data, off))
    }

    /// Size in bytes of the current entry's data.
    pub fn data_size(&self) -> Result<usize> {
        let shared = self.shared.borrow();
        shared.check_open()?;
        self.check_gen(&shared)?;
        self.require_valid()?;
        let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let off = cell_at(&top.page, top.slot);
        Ok(cell_data_size(&top.page.borrow().data, off))
    }

    /// Copy `amount` key bytes starting at `offset`, streaming from the
    /// overflow chain as needed.
    pub fn key(&mut self, offset: usize, amount: usize) -> Result<Vec<u8>> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.check_gen(&shared)?;
        self.require_valid()?;
        let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let off = cell_at(&top.page, top.slot);
        let n_key = cell_key_size(&top.page.borrow().data, off);
        if offset.checked_add(amount).map_or(true, |end| end > n_key) {
            return Err(Error::with_message(ErrorCode::Error, "key read out of range"));
        }
        read_payload(&mut shared.pager, &top.page, off, offset, amount)
    }

    /// Copy `amount` data bytes starting at `offset`.
    pub fn data(&mut self, offset: usize, amount: usize) -> Result<Vec<u8>> {
        let mut shared = self.shared.borrow_mut();
        shared.check_open()?;
        self.check_gen(&shared)?;
        self.require_valid()?;
        let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
        let off = cell_at(&top.page, top.slot);
        let (n_key, n_data) = {
            let hdr = top.page.borrow();
            (cell_key_size(&hdr.data, off), cell_data_size(&hdr.data, off))
        };
        if offset.checked_add(amount).map_or(true, |end| end > n_data) {
            return Err(Error::with_message(ErrorCode::Error, "data read out of range"));
        }
        read_payload(&mut shared.pager, &top.page, off, n_key + offset, amount)
    }

    /// The current entry's full key.
    pub fn full_key(&mut self) -> Result<Vec<u8>> {
        let n = self.key_size()?;
        self.key(0, n)
    }

    /// The current entry's full data.
    pub fn full_data(&mut self) -> Result<Vec<u8>> {
        let n = self.data_size()?;
        self.data(0, n)
    }

    /// Insert a key/value pair, replacing any entry with an equal key.
    /// Leaves the cursor on the inserted entry.
    pub fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        {
            let mut shared = self.shared.borrow_mut();
            shared.check_open()?;
            shared.require_write()?;
            let (mut path, res, valid) = seek(&mut shared, self.root, key)?;
            insert_at(&mut shared, &mut path, res, valid, key, data)?;
            shared.gen += 1;
        }
        self.path.clear();
        self.valid = false;
        let res = self.moveto(key)?;
        if res != 0 {
            return Err(Error::with_message(ErrorCode::Internal, "lost inserted key"));
        }
        Ok(())
    }

    /// Remove the current entry. The cursor lands on the in-order
    /// successor with `skip_next` set, so the next advance stays put.
    pub fn delete(&mut self) -> Result<()> {
        let saved_key;
        {
            let mut shared = self.shared.borrow_mut();
            shared.check_open()?;
            self.check_gen(&shared)?;
            self.require_valid()?;
            shared.require_write()?;
            let top = self.path.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let off = cell_at(&top.page, top.slot);
            saved_key = read_full_key(&mut shared.pager, &top.page, off)?;
            delete_at(&mut shared, &mut self.path)?;
            shared.gen += 1;
        }
        self.path.clear();
        self.valid = false;
        let res = self.moveto(&saved_key)?;
        if res < 0 {
            self.next()?;
        }
        self.skip_next = self.valid;
        Ok(())
    }

    /// Release the cursor's pins and unregister it from the handle.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for BtCursor {
    fn drop(&mut self) {
        self.path.clear();
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            let id = self.id;
            shared.open_cursors.retain(|&c| c != id);
            if shared.open_cursors.is_empty() && shared.in_trans == TransState::None {
                shared.pager.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::btree::{Btree, BtreeConfig};

    fn scratch_db(name: &str) -> (tempfile::TempDir, Btree, u32) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let bt = Btree::open_with_config(path.to_str().unwrap(), BtreeConfig::default()).unwrap();
        bt.begin_trans(true).unwrap();
        let root = bt.create_table("t").unwrap();
        (dir, bt, root)
    }

    #[test]
    fn test_traversal_order() {
        let (_dir, bt, root) = scratch_db("walk.db");
        let mut cur = bt.cursor(root).unwrap();
        for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
            cur.insert(key.as_bytes(), b"v").unwrap();
        }

        assert!(cur.first().unwrap());
        let mut keys = vec![cur.full_key().unwrap()];
        while cur.next().unwrap() {
            keys.push(cur.full_key().unwrap());
        }
        let names: Vec<Vec<u8>> = ["alpha", "bravo", "charlie", "delta", "echo"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(keys, names);

        assert!(cur.last().unwrap());
        let mut rev = vec![cur.full_key().unwrap()];
        while cur.prev().unwrap() {
            rev.push(cur.full_key().unwrap());
        }
        rev.reverse();
        assert_eq!(rev, names);
    }

    #[test]
    fn test_moveto_result_signs() {
        let (_dir, bt, root) = scratch_db("signs.db");
        let mut cur = bt.cursor(root).unwrap();
        assert_eq!(cur.moveto(b"anything").unwrap(), 1);
        assert!(!cur.is_valid());

        cur.insert(b"bb", b"1").unwrap();
        cur.insert(b"dd", b"2").unwrap();

        assert_eq!(cur.moveto(b"bb").unwrap(), 0);
        assert_eq!(cur.moveto(b"cc").unwrap().signum(), 1);
        assert_eq!(cur.full_key().unwrap(), b"dd");
        assert_eq!(cur.moveto(b"ee").unwrap().signum(), -1);
        assert_eq!(cur.full_key().unwrap(), b"dd");
        assert_eq!(cur.moveto(b"aa").unwrap().signum(), 1);
        assert_eq!(cur.full_key().unwrap(), b"bb");
    }

    #[test]
    fn test_delete_leaves_cursor_on_successor() {
        let (_dir, bt, root) = scratch_db("del.db");
        let mut cur = bt.cursor(root).unwrap();
        for key in ["a", "b", "c"] {
            cur.insert(key.as_bytes(), b"v").unwrap();
        }
        cur.moveto(b"b").unwrap();
        cur.delete().unwrap();
        assert!(cur.is_valid());
        assert_eq!(cur.full_key().unwrap(), b"c");
        // skip_next makes the next advance a no-op.
        assert!(cur.next().unwrap());
        assert_eq!(cur.full_key().unwrap(), b"c");
        assert!(!cur.next().unwrap());
    }

    #[test]
    fn test_out_of_range_reads_fail() {
        let (_dir, bt, root) = scratch_db("range.db");
        let mut cur = bt.cursor(root).unwrap();
        cur.insert(b"key", b"value").unwrap();
        cur.moveto(b"key").unwrap();
        assert_eq!(cur.key_size().unwrap(), 3);
        assert_eq!(cur.data_size().unwrap(), 5);
        assert!(cur.data(4, 2).is_err());
        assert!(cur.key(0, 4).is_err());
        assert_eq!(cur.data(1, 3).unwrap(), b"alu");
    }
}
