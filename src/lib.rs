//! oakdb - an embedded B-tree storage engine with an external merge sorter
//!
//! The crate has two public subsystems:
//!
//! * [`storage::btree`] - a persistent, page-oriented, ordered key/value
//!   store with multiple named tables in a single file, accessed through
//!   cursors under transactional control.
//! * [`sort`] - a bounded-memory external merge sort over variable-length
//!   records, spilling sorted runs to temp files and merging them through
//!   a tournament tree, optionally with worker threads.

pub mod error;
pub mod os;
pub mod sort;
pub mod storage;
pub mod types;
pub mod util;

// Re-export the main public types
pub use error::{Error, ErrorCode, Result};
pub use sort::{Sorter, SorterConfig};
pub use storage::btree::{BtCursor, Btree, BtreeConfig};
pub use types::Pgno;
