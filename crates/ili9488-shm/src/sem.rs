//! Process-shared POSIX semaphore embedded in shared memory.

use std::io;

/// A view over a `sem_t` that lives inside a shared mapping.
///
/// The semaphore memory is owned by whoever owns the mapping; this type only
/// wraps the libc calls. With an initial value of 1 the trywait/post bracket
/// gives at-most-one party access to the guarded buffer without either side
/// ever blocking the other.
#[derive(Clone, Copy)]
pub struct SharedSemaphore {
    sem: *mut libc::sem_t,
}

// SAFETY: sem_t is designed for cross-process concurrent use; all access
// goes through the sem_* syscall wrappers.
unsafe impl Send for SharedSemaphore {}
unsafe impl Sync for SharedSemaphore {}

impl SharedSemaphore {
    /// Wrap a semaphore slot in mapped memory.
    ///
    /// # Safety
    ///
    /// `sem` must point to a properly aligned `sem_t` inside a mapping that
    /// outlives this handle.
    pub unsafe fn from_raw(sem: *mut libc::sem_t) -> Self {
        SharedSemaphore { sem }
    }

    /// Initialize as process-shared with the given value.
    ///
    /// Must be called exactly once, by the mapping's creator, before any
    /// other process touches the semaphore.
    pub fn init_shared(&self, value: u32) -> io::Result<()> {
        if unsafe { libc::sem_init(self.sem, 1, value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Non-blocking acquire.
    ///
    /// Returns `Ok(true)` when acquired, `Ok(false)` when the semaphore was
    /// already taken (EAGAIN) or the call was interrupted (EINTR).
    pub fn try_wait(&self) -> io::Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    /// Release one unit.
    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current value (diagnostics and tests).
    pub fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    /// Destroy the semaphore. Only the mapping's creator calls this, after
    /// all other users are gone.
    pub fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.sem);
        }
    }
}
