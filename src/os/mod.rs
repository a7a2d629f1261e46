//! OS abstraction layer
//!
//! The storage engine and the sorter perform all file I/O through the
//! [`vfs::Vfs`] and [`vfs::VfsFile`] traits so the platform layer stays
//! behind one seam.

pub mod vfs;

#[cfg(unix)]
pub mod unix;

pub use vfs::{os_init, vfs_find, vfs_register, OpenFlags, SyncFlags, Vfs, VfsFile};
