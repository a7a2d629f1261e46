//! Virtual File System trait and types
//!
//! The VFS abstraction covers exactly what the engine consumes: positioned
//! reads and writes, truncate, sync, size queries, and optional
//! memory-mapped access for the sorter's temp files. Temp files are opened
//! with exclusive, delete-on-close semantics.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::DbOffset;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY      = 0x0001;
        const READWRITE     = 0x0002;
        const CREATE        = 0x0004;
        const DELETEONCLOSE = 0x0008;
        const EXCLUSIVE     = 0x0010;
        const MAIN_DB       = 0x0100;
        const TEMP_DB       = 0x0200;
    }
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0002;
        const FULL     = 0x0003;
        const DATAONLY = 0x0010;
    }
}

// ============================================================================
// VFS File Trait
// ============================================================================

/// File handle abstraction.
pub trait VfsFile: Send + Sync {
    /// Read from the file at the given offset. A read past end-of-file
    /// returns however many bytes exist; it is not an error.
    fn read(&self, buf: &mut [u8], offset: DbOffset) -> Result<usize>;

    /// Write to the file at the given offset, extending it as needed.
    fn write(&self, buf: &[u8], offset: DbOffset) -> Result<usize>;

    /// Truncate the file to the given size.
    fn truncate(&self, size: DbOffset) -> Result<()>;

    /// Sync file contents to stable storage.
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self) -> Result<DbOffset>;

    /// Map `amount` bytes starting at `offset` into memory, if the
    /// platform supports it. `None` means the caller must fall back to
    /// buffered reads. `offset` must be a multiple of the system page size.
    fn fetch(&self, _offset: DbOffset, _amount: usize) -> Result<Option<*const u8>> {
        Ok(None)
    }

    /// Release a mapping previously returned by `fetch`.
    fn unfetch(&self, _offset: DbOffset, _data: *const u8) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// VFS Trait
// ============================================================================

/// Virtual File System - platform abstraction.
pub trait Vfs: Send + Sync {
    /// VFS name (e.g. "unix").
    fn name(&self) -> &str;

    /// Open a file. `path` of `None` requests an anonymous temp file,
    /// created exclusively and deleted when the handle drops.
    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    /// Delete a file by name.
    fn delete(&self, path: &str) -> Result<()>;

    /// Check whether a file exists.
    fn access(&self, path: &str) -> Result<bool>;
}

// ============================================================================
// VFS Registry
// ============================================================================

/// Process-wide VFS registry.
struct VfsRegistry {
    vfs_list: Vec<Arc<dyn Vfs>>,
    default_vfs: Option<Arc<dyn Vfs>>,
}

impl VfsRegistry {
    fn new() -> Self {
        Self {
            vfs_list: Vec::new(),
            default_vfs: None,
        }
    }

    fn register(&mut self, vfs: Arc<dyn Vfs>, make_default: bool) {
        let name = vfs.name().to_string();
        self.vfs_list.retain(|v| v.name() != name);
        if make_default || self.default_vfs.is_none() {
            self.default_vfs = Some(vfs.clone());
        }
        self.vfs_list.push(vfs);
    }

    fn find(&self, name: Option<&str>) -> Option<Arc<dyn Vfs>> {
        match name {
            None => self.default_vfs.clone(),
            Some(name) => self.vfs_list.iter().find(|v| v.name() == name).cloned(),
        }
    }
}

lazy_static::lazy_static! {
    static ref VFS_REGISTRY: Mutex<VfsRegistry> = Mutex::new(VfsRegistry::new());
}

/// Find a VFS by name, or the default when `name` is `None`. Registers the
/// platform VFS on first use.
pub fn vfs_find(name: Option<&str>) -> Result<Arc<dyn Vfs>> {
    os_init();
    VFS_REGISTRY
        .lock()
        .unwrap()
        .find(name)
        .ok_or_else(|| Error::with_message(ErrorCode::Error, "no such vfs"))
}

/// Register a VFS implementation.
pub fn vfs_register(vfs: Arc<dyn Vfs>, make_default: bool) {
    VFS_REGISTRY.lock().unwrap().register(vfs, make_default);
}

/// Initialize the OS layer, registering the platform VFS.
pub fn os_init() {
    #[cfg(unix)]
    crate::os::unix::register_unix_vfs();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(flags.contains(OpenFlags::READWRITE));
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::READONLY));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_vfs_registered() {
        let vfs = vfs_find(None).unwrap();
        assert_eq!(vfs.name(), "unix");
    }
}
