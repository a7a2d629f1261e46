//! Core type aliases for oakdb

/// Page number type. Page numbers are 1-based; 0 means "no page".
pub type Pgno = u32;

/// Database or temp-file byte offset.
pub type DbOffset = i64;

/// Byte count type.
pub type ByteCount = usize;
