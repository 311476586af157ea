//! Named POSIX shared-memory segments.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

/// A mapped POSIX shared-memory object.
///
/// The creator owns the name: dropping the creating side unlinks the object,
/// dropping an opened side only unmaps. World-writable (0666) so unprivileged
/// producers can connect, matching the daemon's producer contract.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
    name: CString,
    owner: bool,
}

// SAFETY: the mapping is plain shared memory; synchronization of its contents
// is the responsibility of the protocol layered on top.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

/// Prepend the leading `/` that `shm_open` requires if the caller left it off.
pub fn normalize_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

impl SharedMemory {
    /// Create (or replace) a named segment of `len` bytes.
    ///
    /// A stale object with the same name is unlinked and recreated, so a
    /// daemon restart always starts from a fresh, zeroed region.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let name = normalize_name(name);
        let c_name = CString::new(name.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid shm name"))?;

        unsafe {
            libc::umask(0);
            // Drop any leftover from a previous run before creating exclusively.
            libc::shm_unlink(c_name.as_ptr());
        }

        let mut raw = unsafe {
            libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o666)
        };
        if raw < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
                raw = libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o666,
                );
            }
        }
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }
        // The umask call above should make this a no-op; some libcs still
        // apply the caller's mode mask to shm_open.
        if unsafe { libc::fchmod(fd.as_raw_fd(), 0o666) } < 0 {
            tracing::warn!(
                name,
                error = %io::Error::last_os_error(),
                "failed to chmod shared memory"
            );
        }

        let ptr = Self::map(&fd, len)?;
        Ok(SharedMemory {
            ptr,
            len,
            fd,
            name: c_name,
            owner: true,
        })
    }

    /// Open an existing named segment read-write, sized from `fstat`.
    pub fn open(name: &str) -> io::Result<Self> {
        let name = normalize_name(name);
        let c_name = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid shm name"))?;

        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = stat.st_size as usize;

        let ptr = Self::map(&fd, len)?;
        Ok(SharedMemory {
            ptr,
            len,
            fd,
            name: c_name,
            owner: false,
        })
    }

    fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(NonNull::new(ptr as *mut u8).unwrap())
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Whether this handle created (and will unlink) the object.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}
