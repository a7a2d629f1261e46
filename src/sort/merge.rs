//! Merge tournament
//!
//! K PMA readers feed an implicit tournament tree of size N, the smallest
//! power of two >= K, stored as a flat array: leaves (indices N/2..N) hold
//! the winner of each pair of readers, each internal node the winner of
//! its children, and `tree[1]` names the overall winner (`tree[0]` is
//! unused). Advancing steps the winner's reader and replays the path from
//! its leaf to the root, one comparison per level. On equal keys the
//! reader with the smaller index wins; readers are arranged in acceptance
//! order, so the older run wins and the merge is stable.

use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::sort::pma::{PmaReader, PmaSpan, PmaWriter, TempFile};
use crate::sort::SortKey;
use crate::util::varint::varint_len;

/// Largest number of PMAs merged in one pass.
pub(crate) const MERGE_FANIN: usize = 16;

const NO_READER: u16 = u16::MAX;

// ============================================================================
// Tournament tree
// ============================================================================

pub(crate) struct MergeEngine {
    readers: Vec<PmaReader>,
    key: Arc<SortKey>,
    /// `tree[i]` is the reader index winning at node `i`.
    tree: Vec<u16>,
    /// Tree size: smallest power of two covering the readers.
    n_tree: usize,
}

/// Tree node whose two inputs are readers `2j - N` and `2j - N + 1`.
fn leaf_for(reader: usize, n_tree: usize) -> usize {
    (n_tree + reader) / 2
}

fn parent(node: usize) -> usize {
    node / 2
}

impl MergeEngine {
    /// Build the tournament over `readers`, which must already be ordered
    /// by acceptance sequence.
    pub(crate) fn new(readers: Vec<PmaReader>, key: Arc<SortKey>) -> Self {
        let n_tree = readers.len().next_power_of_two().max(2);
        let mut engine = Self {
            readers,
            key,
            tree: vec![NO_READER; n_tree],
            n_tree,
        };
        // Leaves first, then each internal level.
        for node in (1..n_tree).rev() {
            engine.tree[node] = engine.winner_at(node);
        }
        engine
    }

    /// Winner of the pair feeding tree node `node`.
    fn winner_at(&self, node: usize) -> u16 {
        if node >= self.n_tree / 2 {
            let r0 = 2 * node - self.n_tree;
            self.better(r0 as u16, (r0 + 1) as u16)
        } else {
            self.better(self.tree[2 * node], self.tree[2 * node + 1])
        }
    }

    /// The reader producing the smaller current record; exhausted readers
    /// lose, equal keys go to the smaller (older) index.
    fn better(&self, a: u16, b: u16) -> u16 {
        let key_a = self.reader_key(a);
        let key_b = self.reader_key(b);
        match (key_a, key_b) {
            (None, None) => a.min(b),
            (Some(_), None) => a,
            (None, Some(_)) => b,
            (Some(ka), Some(kb)) => match self.key.compare(ka, kb) {
                std::cmp::Ordering::Less => a,
                std::cmp::Ordering::Greater => b,
                std::cmp::Ordering::Equal => a.min(b),
            },
        }
    }

    fn reader_key(&self, idx: u16) -> Option<&[u8]> {
        self.readers.get(idx as usize).and_then(|r| r.key())
    }

    /// True once every reader is exhausted.
    pub(crate) fn eof(&self) -> bool {
        self.reader_key(self.tree[1]).is_none()
    }

    /// The overall winner's record.
    pub(crate) fn key(&self) -> Option<&[u8]> {
        self.reader_key(self.tree[1])
    }

    /// Step the winner and replay its leaf-to-root path.
    pub(crate) fn next(&mut self) -> Result<bool> {
        let winner = self.tree[1] as usize;
        if winner >= self.readers.len() {
            return Ok(false);
        }
        self.readers[winner].next()?;
        let mut node = leaf_for(winner, self.n_tree);
        loop {
            self.tree[node] = self.winner_at(node);
            if node == 1 {
                break;
            }
            node = parent(node);
        }
        Ok(!self.eof())
    }
}

// ============================================================================
// Multi-pass merging
// ============================================================================

/// Merge one group of contiguous-sequence spans into a single PMA written
/// at `out_end` of `out_file`. Returns the new span, carrying the group's
/// first sequence number.
pub(crate) fn merge_group(
    spans: &[PmaSpan],
    out_file: Arc<TempFile>,
    out_end: u64,
    key: &Arc<SortKey>,
    n_buf: usize,
    mmap_limit: i64,
) -> Result<PmaSpan> {
    debug_assert!(!spans.is_empty() && spans.len() <= MERGE_FANIN);
    let mut readers = Vec::with_capacity(spans.len());
    for span in spans {
        readers.push(PmaReader::begin(span, n_buf, mmap_limit)?);
    }
    let mut engine = MergeEngine::new(readers, Arc::clone(key));

    // Re-encoding each record reproduces the input byte counts, so the
    // merged content size is just the sum.
    let content: u64 = spans.iter().map(|s| s.content).sum();
    let mut writer = PmaWriter::new(Arc::clone(&out_file), n_buf, out_end);
    writer.write_varint(content);
    while let Some(record) = engine.key() {
        writer.write_varint(record.len() as u64);
        writer.write(record);
        engine.next()?;
    }
    let end = writer.finish()?;
    debug_assert_eq!(end, out_end + varint_len(content) as u64 + content);

    debug!(
        "sorter: merged {} pmas ({} bytes) from seq {}",
        spans.len(),
        content,
        spans[0].seq
    );
    Ok(PmaSpan {
        file: out_file,
        start: out_end,
        end,
        content,
        seq: spans[0].seq,
    })
}
