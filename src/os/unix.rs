//! Unix VFS implementation over raw libc
//!
//! Positioned I/O uses pread/pwrite so one descriptor serves concurrent
//! readers without seek-pointer races. Temp files are created with mkstemp
//! and unlinked immediately, which gives delete-on-close for free.

use std::ffi::CString;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex, Once};

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{vfs_register, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::types::DbOffset;

fn last_errno() -> c_int {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        *libc::__error()
    }
}

fn errno_to_code(errno: c_int) -> ErrorCode {
    match errno {
        libc::ENOENT => ErrorCode::CantOpen,
        libc::EACCES | libc::EPERM => ErrorCode::Perm,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::Full,
        libc::EBUSY | libc::EAGAIN => ErrorCode::Busy,
        libc::EINTR => ErrorCode::Interrupt,
        libc::ENOMEM => ErrorCode::NoMem,
        libc::EROFS => ErrorCode::ReadOnly,
        _ => ErrorCode::IoErr,
    }
}

fn io_error() -> Error {
    Error::new(errno_to_code(last_errno()))
}

// ============================================================================
// Unix File
// ============================================================================

/// An open file descriptor. Active mmap regions are tracked as
/// (address, length) pairs so drop can release whatever remains.
pub struct UnixFile {
    fd: c_int,
    maps: Mutex<Vec<(usize, usize)>>,
}

impl UnixFile {
    fn new(fd: c_int) -> Self {
        Self {
            fd,
            maps: Mutex::new(Vec::new()),
        }
    }
}

impl VfsFile for UnixFile {
    fn read(&self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let rc = unsafe {
                libc::pread(
                    self.fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                    offset + done as DbOffset,
                )
            };
            if rc < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                return Err(io_error());
            }
            if rc == 0 {
                break;
            }
            done += rc as usize;
        }
        Ok(done)
    }

    fn write(&self, buf: &[u8], offset: DbOffset) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let rc = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                    offset + done as DbOffset,
                )
            };
            if rc < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                return Err(io_error());
            }
            done += rc as usize;
        }
        Ok(done)
    }

    fn truncate(&self, size: DbOffset) -> Result<()> {
        let rc = unsafe { libc::ftruncate(self.fd, size) };
        if rc != 0 {
            return Err(io_error());
        }
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            #[cfg(target_os = "linux")]
            unsafe {
                libc::fdatasync(self.fd)
            }
            #[cfg(not(target_os = "linux"))]
            unsafe {
                libc::fsync(self.fd)
            }
        } else {
            unsafe { libc::fsync(self.fd) }
        };
        if rc != 0 {
            return Err(io_error());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut stat) } != 0 {
            return Err(io_error());
        }
        Ok(stat.st_size as DbOffset)
    }

    fn fetch(&self, offset: DbOffset, amount: usize) -> Result<Option<*const u8>> {
        if amount == 0 {
            return Ok(None);
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                amount,
                libc::PROT_READ,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Ok(None);
        }
        self.maps.lock().unwrap().push((ptr as usize, amount));
        Ok(Some(ptr as *const u8))
    }

    fn unfetch(&self, _offset: DbOffset, data: *const u8) -> Result<()> {
        let mut maps = self.maps.lock().unwrap();
        if let Some(pos) = maps.iter().position(|&(addr, _)| addr == data as usize) {
            let (addr, len) = maps.swap_remove(pos);
            unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        }
        Ok(())
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        for (addr, len) in self.maps.lock().unwrap().drain(..) {
            unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        }
        unsafe { libc::close(self.fd) };
    }
}

// ============================================================================
// Unix VFS
// ============================================================================

/// The default Unix VFS.
pub struct UnixVfs;

impl UnixVfs {
    fn open_temp(&self) -> Result<Box<dyn VfsFile>> {
        let dir = std::env::temp_dir();
        let template = dir.join("oakdb-XXXXXX");
        let mut template_bytes = template
            .to_str()
            .ok_or_else(|| Error::new(ErrorCode::CantOpen))?
            .as_bytes()
            .to_vec();
        template_bytes.push(0);
        let fd = unsafe { libc::mkstemp(template_bytes.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(Error::new(errno_to_code(last_errno())));
        }
        // Unlink now; the descriptor keeps the file alive until close.
        unsafe { libc::unlink(template_bytes.as_ptr() as *const libc::c_char) };
        Ok(Box::new(UnixFile::new(fd)))
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        "unix"
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let path = match path {
            None => return self.open_temp(),
            Some(path) => path,
        };

        let mut oflags: c_int = 0;
        if flags.contains(OpenFlags::READWRITE) {
            oflags |= libc::O_RDWR;
        } else {
            oflags |= libc::O_RDONLY;
        }
        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }

        let c_path =
            CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644 as libc::c_uint) };
        if fd < 0 {
            return Err(Error::new(errno_to_code(last_errno())));
        }
        Ok(Box::new(UnixFile::new(fd)))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };
        if rc != 0 && last_errno() != libc::ENOENT {
            return Err(io_error());
        }
        Ok(())
    }

    fn access(&self, path: &str) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let rc = unsafe { libc::access(c_path.as_ptr(), libc::F_OK) };
        Ok(rc == 0)
    }
}

static UNIX_VFS_ONCE: Once = Once::new();

/// Register the Unix VFS as the process default. Idempotent.
pub fn register_unix_vfs() {
    UNIX_VFS_ONCE.call_once(|| {
        vfs_register(Arc::new(UnixVfs), true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_roundtrip() {
        let vfs = UnixVfs;
        let file = vfs.open(None, OpenFlags::empty()).unwrap();
        file.write(b"hello oakdb", 0).unwrap();
        file.write(b"!", 11).unwrap();

        let mut buf = [0u8; 12];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf, b"hello oakdb!");
        assert_eq!(file.file_size().unwrap(), 12);

        file.truncate(5).unwrap();
        assert_eq!(file.file_size().unwrap(), 5);
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let vfs = UnixVfs;
        let file = vfs.open(None, OpenFlags::empty()).unwrap();
        file.write(b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 3);
        assert_eq!(file.read(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_fetch_maps_file() {
        let vfs = UnixVfs;
        let file = vfs.open(None, OpenFlags::empty()).unwrap();
        file.write(b"mapped bytes", 0).unwrap();
        if let Some(ptr) = file.fetch(0, 12).unwrap() {
            let view = unsafe { std::slice::from_raw_parts(ptr, 12) };
            assert_eq!(view, b"mapped bytes");
            file.unfetch(0, ptr).unwrap();
        }
    }
}
