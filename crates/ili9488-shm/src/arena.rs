//! The triple-buffer arena: daemon-owned creation, role rotation and the
//! producer client.
//!
//! Role indices `front`, `back`, `pending` form a permutation of `{0,1,2}`
//! over the three physical buffers. The daemon is the only party that
//! mutates the permutation; producers only ever read `pending_index` while
//! holding the pending semaphore.

use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::layout::{region_size, ArenaHeader, LayoutError};
use crate::region::SharedMemory;
use crate::sem::SharedSemaphore;

/// Errors from creating or opening an arena.
#[derive(Debug)]
pub enum ArenaError {
    Io(io::Error),
    Layout(LayoutError),
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "shared memory I/O error: {e}"),
            Self::Layout(e) => write!(f, "arena layout error: {e}"),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
        }
    }
}

impl From<io::Error> for ArenaError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LayoutError> for ArenaError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

/// Daemon-side owner of the shared arena.
///
/// Holds the authoritative copy of the role permutation; the header mirrors
/// it for producers and remote DMA masters. The daemon's DMA-coherent
/// buffers live elsewhere (the buffer pool); this region carries the header
/// plus a mirror triple that ordinary processes can reach without any
/// device access.
pub struct TripleBufferArena {
    shm: SharedMemory,
    buffer_size: usize,
    bus_addrs: [u32; 3],
    front: u32,
    back: u32,
    pending: u32,
}

impl TripleBufferArena {
    /// Create the named arena for a `width x height` framebuffer.
    ///
    /// `bus_addrs` are the bus addresses of the daemon's three DMA buffers
    /// (zeroes when the pool has no bus addresses); they are published in
    /// role order and republished on every rotation.
    pub fn create(
        name: &str,
        width: u32,
        height: u32,
        bus_addrs: [u32; 3],
    ) -> Result<Self, ArenaError> {
        let buffer_size = width as usize * height as usize * 3;
        let total = region_size(width, height);
        let shm = SharedMemory::create(name, total)?;

        // SAFETY: the region was just created and sized for the header; no
        // other process can hold a mapping yet.
        let header = unsafe { &mut *(shm.as_ptr() as *mut ArenaHeader) };
        header.init(width, height, bus_addrs);

        let sem = unsafe { SharedSemaphore::from_raw(&mut header.pending_sem) };
        sem.init_shared(1)?;

        tracing::info!(
            name,
            width,
            height,
            total_bytes = total,
            dma_capable = bus_addrs.iter().all(|&a| a != 0),
            "created triple-buffer arena"
        );

        Ok(TripleBufferArena {
            shm,
            buffer_size,
            bus_addrs,
            front: 0,
            back: 1,
            pending: 2,
        })
    }

    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        // SAFETY: the mapping outlives self and the header was initialized
        // in create(); all mutable fields are atomics.
        unsafe { &*(self.shm.as_ptr() as *const ArenaHeader) }
    }

    /// The pending-buffer semaphore.
    #[inline]
    pub fn pending_sem(&self) -> SharedSemaphore {
        // SAFETY: pending_sem sits inside the mapping owned by self.
        unsafe {
            SharedSemaphore::from_raw(&self.header().pending_sem as *const _ as *mut libc::sem_t)
        }
    }

    /// Bytes per framebuffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Current `(front, back, pending)` permutation.
    #[inline]
    pub fn role_indices(&self) -> (u32, u32, u32) {
        (self.front, self.back, self.pending)
    }

    /// Cycle a freshly produced frame straight to front:
    /// `(front, back, pending) <- (pending, front, back)`.
    ///
    /// Used on the no-rotation path. Callers must not hold the pending
    /// semaphore; the permutation and bus slots are daemon-private state
    /// that producers only consult for the pending role.
    pub fn rotate3(&mut self) {
        let old_front = self.front;
        self.front = self.pending;
        self.pending = self.back;
        self.back = old_front;
        self.publish_roles();
    }

    /// Swap front and back, after a rotation pass deposited the rotated
    /// frame into back.
    pub fn swap_back_front(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
        self.publish_roles();
    }

    /// Republish role indices and the role-ordered bus addresses.
    fn publish_roles(&self) {
        let header = self.header();
        header.front_index.store(self.front, Ordering::Release);
        header.back_index.store(self.back, Ordering::Release);
        header.pending_index.store(self.pending, Ordering::Release);
        header
            .front_bus_addr
            .store(self.bus_addrs[self.front as usize], Ordering::Release);
        header
            .back_bus_addr
            .store(self.bus_addrs[self.back as usize], Ordering::Release);
        header
            .pending_bus_addr
            .store(self.bus_addrs[self.pending as usize], Ordering::Release);
    }

    /// Mirror slot currently holding the pending role.
    ///
    /// # Safety
    ///
    /// Caller must hold the pending semaphore, which is the only thing
    /// keeping a producer from writing the same bytes.
    pub unsafe fn pending_mirror(&self) -> &[u8] {
        let base = self
            .shm
            .as_ptr()
            .add(std::mem::size_of::<ArenaHeader>() + self.pending as usize * self.buffer_size);
        std::slice::from_raw_parts(base, self.buffer_size)
    }

    /// Last frame counter published by a producer.
    #[inline]
    pub fn frame_counter(&self) -> u32 {
        self.header().frame_counter.load(Ordering::Acquire)
    }

    /// Rotation requested by the configuration and mirrored for producers.
    pub fn set_rotation_degrees(&self, degrees: u32) {
        self.header()
            .rotation_degrees
            .store(degrees, Ordering::Release);
    }

    #[inline]
    pub fn rotation_degrees(&self) -> u32 {
        self.header().rotation_degrees.load(Ordering::Acquire)
    }

    /// Raise the liveness flag producers wait on.
    pub fn set_daemon_ready(&self) {
        self.header().daemon_ready.store(1, Ordering::Release);
    }

    #[inline]
    pub fn producer_connected(&self) -> bool {
        self.header().app_connected.load(Ordering::Acquire) != 0
    }
}

impl Drop for TripleBufferArena {
    fn drop(&mut self) {
        // The SharedMemory drop unmaps and unlinks; the semaphore goes first.
        self.pending_sem().destroy();
        tracing::debug!("destroyed triple-buffer arena");
    }
}

/// Producer-side handle to an arena created by the daemon.
pub struct ArenaClient {
    shm: SharedMemory,
    frame_bytes: usize,
}

impl ArenaClient {
    /// Open and validate the named arena.
    pub fn open(name: &str) -> Result<Self, ArenaError> {
        let shm = SharedMemory::open(name)?;
        if shm.len() < std::mem::size_of::<ArenaHeader>() {
            return Err(LayoutError::RegionTooSmall {
                required: std::mem::size_of::<ArenaHeader>(),
                found: shm.len(),
            }
            .into());
        }

        // SAFETY: length checked above; validation rejects foreign contents.
        let header = unsafe { &*(shm.as_ptr() as *const ArenaHeader) };
        header.validate()?;

        let frame_bytes = header.frame_bytes();
        let required = std::mem::size_of::<ArenaHeader>() + 3 * frame_bytes;
        if shm.len() < required {
            return Err(LayoutError::RegionTooSmall {
                required,
                found: shm.len(),
            }
            .into());
        }

        Ok(ArenaClient { shm, frame_bytes })
    }

    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        // SAFETY: validated in open().
        unsafe { &*(self.shm.as_ptr() as *const ArenaHeader) }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.header().width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.header().height
    }

    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    #[inline]
    pub fn frame_counter(&self) -> u32 {
        self.header().frame_counter.load(Ordering::Acquire)
    }

    /// Announce this producer to the daemon.
    pub fn mark_connected(&self) {
        self.header().app_connected.store(1, Ordering::Release);
    }

    /// Poll `daemon_ready` until set or the timeout elapses.
    pub fn wait_daemon_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.header().daemon_ready.load(Ordering::Acquire) == 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// One producer iteration: trywait, write the pending buffer, bump the
    /// frame counter, post.
    ///
    /// Returns `Ok(false)` without calling `write` when the pending buffer
    /// is busy; the producer decides whether to retry or drop the frame.
    pub fn try_submit_frame<F>(&self, write: F) -> io::Result<bool>
    where
        F: FnOnce(&mut [u8], u32, u32),
    {
        let header = self.header();
        let sem = unsafe {
            SharedSemaphore::from_raw(&header.pending_sem as *const _ as *mut libc::sem_t)
        };
        if !sem.try_wait()? {
            return Ok(false);
        }

        let pending = header.pending_index.load(Ordering::Acquire) as usize;
        // SAFETY: the semaphore is held, so the daemon will not read (and no
        // other producer will write) this slot until we post.
        let buf = unsafe {
            let base = self
                .shm
                .as_ptr()
                .add(std::mem::size_of::<ArenaHeader>() + pending * self.frame_bytes);
            std::slice::from_raw_parts_mut(base, self.frame_bytes)
        };
        write(buf, header.width, header.height);

        header.frame_counter.fetch_add(1, Ordering::AcqRel);
        sem.post()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("arena-test-{}-{}-{}", tag, std::process::id(), id)
    }

    #[test]
    fn rotate3_three_times_is_identity() {
        let mut arena =
            TripleBufferArena::create(&unique_name("rot3"), 8, 8, [0; 3]).unwrap();
        assert_eq!(arena.role_indices(), (0, 1, 2));
        arena.rotate3();
        assert_eq!(arena.role_indices(), (2, 0, 1));
        arena.rotate3();
        assert_eq!(arena.role_indices(), (1, 2, 0));
        arena.rotate3();
        assert_eq!(arena.role_indices(), (0, 1, 2));
    }

    #[test]
    fn swap_back_front_twice_is_identity() {
        let mut arena =
            TripleBufferArena::create(&unique_name("swap"), 8, 8, [0; 3]).unwrap();
        arena.swap_back_front();
        assert_eq!(arena.role_indices(), (1, 0, 2));
        arena.swap_back_front();
        assert_eq!(arena.role_indices(), (0, 1, 2));
    }

    #[test]
    fn roles_stay_a_permutation() {
        let mut arena =
            TripleBufferArena::create(&unique_name("perm"), 8, 8, [0; 3]).unwrap();
        // Arbitrary interleaving of the two operations.
        for step in 0..32 {
            if step % 3 == 0 {
                arena.swap_back_front();
            } else {
                arena.rotate3();
            }
            let (f, b, p) = arena.role_indices();
            let mut seen = [false; 3];
            for idx in [f, b, p] {
                seen[idx as usize] = true;
            }
            assert_eq!(seen, [true; 3], "roles must stay a permutation of 0..3");

            // The header mirrors the daemon-local permutation.
            assert_eq!(arena.header().role_indices(), (f, b, p));
        }
    }

    #[test]
    fn bus_slots_follow_roles() {
        let bus = [0x1000, 0x2000, 0x3000];
        let mut arena =
            TripleBufferArena::create(&unique_name("bus"), 8, 8, bus).unwrap();
        for step in 0..16 {
            if step % 2 == 0 {
                arena.rotate3();
            } else {
                arena.swap_back_front();
            }
            let (f, b, p) = arena.role_indices();
            let header = arena.header();
            assert_eq!(
                header.front_bus_addr.load(Ordering::Acquire),
                bus[f as usize]
            );
            assert_eq!(
                header.back_bus_addr.load(Ordering::Acquire),
                bus[b as usize]
            );
            assert_eq!(
                header.pending_bus_addr.load(Ordering::Acquire),
                bus[p as usize]
            );
        }
    }

    #[test]
    fn created_header_fields() {
        let name = unique_name("hdr");
        let arena = TripleBufferArena::create(&name, 320, 240, [0; 3]).unwrap();
        let header = arena.header();
        assert_eq!(header.magic, crate::ARENA_MAGIC);
        assert_eq!(header.version, 1);
        assert_eq!(header.bytes_per_pixel, 3);
        assert_eq!(header.role_indices(), (0, 1, 2));
        assert_eq!(arena.pending_sem().value().unwrap(), 1);
        assert_eq!(arena.buffer_size(), 320 * 240 * 3);
    }

    #[test]
    fn client_submit_increments_counter() {
        let name = unique_name("submit");
        let arena = TripleBufferArena::create(&name, 4, 2, [0; 3]).unwrap();
        arena.set_daemon_ready();

        let client = ArenaClient::open(&name).unwrap();
        assert!(client.wait_daemon_ready(Duration::from_millis(100)));
        client.mark_connected();
        assert!(arena.producer_connected());

        let wrote = client
            .try_submit_frame(|buf, w, h| {
                assert_eq!(buf.len(), (w * h * 3) as usize);
                buf.fill(0xAC);
            })
            .unwrap();
        assert!(wrote);
        assert_eq!(arena.frame_counter(), 1);

        // The daemon-side mirror view sees the bytes (pending role unmoved).
        let sem = arena.pending_sem();
        assert!(sem.try_wait().unwrap());
        let mirror = unsafe { arena.pending_mirror() };
        assert!(mirror.iter().all(|&b| b == 0xAC));
        sem.post().unwrap();
    }

    #[test]
    fn submit_skips_when_sem_held() {
        let name = unique_name("busy");
        let arena = TripleBufferArena::create(&name, 4, 2, [0; 3]).unwrap();
        let client = ArenaClient::open(&name).unwrap();

        let sem = arena.pending_sem();
        assert!(sem.try_wait().unwrap());
        let wrote = client.try_submit_frame(|_, _, _| panic!("must not write")).unwrap();
        assert!(!wrote);
        assert_eq!(client.frame_counter(), 0);
        sem.post().unwrap();
    }
}
