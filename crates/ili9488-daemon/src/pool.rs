//! The DMA buffer pool: three physically contiguous, bus-addressable frame
//! buffers.
//!
//! Allocation strategies, tried in order; the first that succeeds is adopted
//! for all three buffers:
//!
//! 1. CMA via a dma-heap, with bus addresses discovered through
//!    `/dev/vcsm-cma` (missing VCSM leaves the buffers usable but not
//!    DMA-rotatable).
//! 2. VideoCore mailbox allocations mapped through `/dev/mem`.
//! 3. Plain page-aligned CPU memory with zero bus addresses.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::ioc;
use crate::mailbox::{
    BusMapping, Mailbox, MEM_FLAG_COHERENT, MEM_FLAG_DIRECT, MEM_FLAG_ZERO,
};
use crate::peripheral::PAGE_SIZE;

/// dma-heap names worth trying before falling back to a directory scan.
const DMA_HEAP_CANDIDATES: [&str; 3] = ["linux,cma", "reserved", "system"];

/// `struct dma_heap_allocation_data` from `<linux/dma-heap.h>`.
#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

/// `DMA_HEAP_IOCTL_ALLOC = _IOWR('H', 0x0, struct dma_heap_allocation_data)`.
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong =
    ioc::iowr(b'H' as u32, 0x0, std::mem::size_of::<DmaHeapAllocationData>());

const VCSM_RESOURCE_NAME_LEN: usize = 32;

/// `struct vcsm_import_dmabuf` from the vcsm-cma driver.
#[repr(C)]
struct VcsmImportDmabuf {
    dmabuf_fd: i32,
    cached: u32,
    name: [u8; VCSM_RESOURCE_NAME_LEN],
    handle: i32,
    vc_handle: u32,
    size: u32,
    pad: u32,
    dma_addr: u64,
}

/// `VCSM_CMA_IOCTL_MEM_IMPORT_DMABUF = _IOR('J', 0x5B, struct vcsm_import_dmabuf)`.
const VCSM_CMA_IOCTL_MEM_IMPORT_DMABUF: libc::c_ulong =
    ioc::ior(b'J' as u32, 0x5B, std::mem::size_of::<VcsmImportDmabuf>());

/// Which allocator ended up backing the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStrategy {
    CmaHeap,
    Mailbox,
    Cpu,
}

impl PoolStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CmaHeap => "cma-heap",
            Self::Mailbox => "mailbox",
            Self::Cpu => "cpu",
        }
    }
}

struct CmaBuffer {
    map: NonNull<u8>,
    len: usize,
    dmabuf: OwnedFd,
}

impl Drop for CmaBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Keeps the CMA mappings, the vcsm handle and the heap fd alive; teardown
/// is the field drop order (buffers, then vcsm, then the heap).
struct CmaPool {
    _buffers: Vec<CmaBuffer>,
    _vcsm: Option<OwnedFd>,
    _heap: OwnedFd,
}

struct MailboxBuffer {
    handle: u32,
    bus_addr: u32,
    mapping: Option<BusMapping>,
}

struct MailboxPool {
    mailbox: Mailbox,
    buffers: Vec<MailboxBuffer>,
}

impl Drop for MailboxPool {
    fn drop(&mut self) {
        for mut buf in self.buffers.drain(..) {
            // Unmap before handing the memory back to the firmware.
            buf.mapping.take();
            if let Err(e) = self.mailbox.unlock(buf.handle) {
                tracing::warn!(handle = buf.handle, error = %e, "mailbox unlock failed");
            }
            if let Err(e) = self.mailbox.release(buf.handle) {
                tracing::warn!(handle = buf.handle, error = %e, "mailbox release failed");
            }
        }
    }
}

struct CpuBuffer {
    map: NonNull<u8>,
    len: usize,
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

enum Backing {
    CmaHeap(CmaPool),
    Mailbox(MailboxPool),
    Cpu(Vec<CpuBuffer>),
}

// SAFETY: the raw pointers reference mappings owned by the backing; access
// discipline (disjoint roles) is enforced by the frame loop.
unsafe impl Send for Backing {}

/// Three equally sized DMA-coherent frame buffers.
pub struct DmaBufferPool {
    frame_bytes: usize,
    buffer_size: usize,
    bus_addrs: [u32; 3],
    ptrs: [NonNull<u8>; 3],
    strategy: PoolStrategy,
    _backing: Backing,
}

// SAFETY: see Backing.
unsafe impl Send for DmaBufferPool {}

impl DmaBufferPool {
    /// Allocate buffers for a `width x height` RGB666 frame, walking the
    /// strategy ladder.
    pub fn allocate(width: u32, height: u32) -> io::Result<Self> {
        let frame_bytes = width as usize * height as usize * 3;
        let buffer_size = (frame_bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        match Self::allocate_cma(frame_bytes, buffer_size) {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                tracing::info!(error = %e, "CMA dma-heap allocation unavailable, trying mailbox");
            }
        }
        match Self::allocate_mailbox(frame_bytes, buffer_size) {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                tracing::info!(error = %e, "mailbox allocation unavailable, using CPU buffers");
            }
        }
        Self::allocate_cpu(frame_bytes, buffer_size)
    }

    /// Plain CPU buffers only; hardware rotation and bus-address transfers
    /// are off. Also what the protocol tests run on.
    pub fn allocate_cpu_only(width: u32, height: u32) -> io::Result<Self> {
        let frame_bytes = width as usize * height as usize * 3;
        let buffer_size = (frame_bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self::allocate_cpu(frame_bytes, buffer_size)
    }

    fn allocate_cma(frame_bytes: usize, buffer_size: usize) -> io::Result<Self> {
        let heap = open_any_dma_heap()?;

        let mut buffers = Vec::with_capacity(3);
        for _ in 0..3 {
            buffers.push(alloc_dma_heap_buffer(&heap, buffer_size)?);
        }

        // Bus addresses come from vcsm-cma; without it the buffers still
        // work, they just cannot feed the DMA engine.
        let mut bus_addrs = [0u32; 3];
        let vcsm = match crate::mailbox::open_cloexec(c"/dev/vcsm-cma", libc::O_RDWR) {
            Ok(vcsm) => {
                for (i, buf) in buffers.iter().enumerate() {
                    match vcsm_import(&vcsm, &buf.dmabuf) {
                        Ok(dma_addr) => bus_addrs[i] = dma_addr,
                        Err(e) => {
                            tracing::warn!(buffer = i, error = %e, "vcsm-cma import failed");
                        }
                    }
                }
                Some(vcsm)
            }
            Err(e) => {
                tracing::info!(error = %e, "/dev/vcsm-cma unavailable, no bus addresses");
                None
            }
        };

        let ptrs = [buffers[0].map, buffers[1].map, buffers[2].map];
        tracing::info!(
            buffer_size,
            bus_addrs = ?bus_addrs.map(|a| format!("{a:#010x}")),
            "allocated frame buffers from CMA dma-heap"
        );
        Ok(DmaBufferPool {
            frame_bytes,
            buffer_size,
            bus_addrs,
            ptrs,
            strategy: PoolStrategy::CmaHeap,
            _backing: Backing::CmaHeap(CmaPool {
                _buffers: buffers,
                _vcsm: vcsm,
                _heap: heap,
            }),
        })
    }

    fn allocate_mailbox(frame_bytes: usize, buffer_size: usize) -> io::Result<Self> {
        let mailbox = Mailbox::open()?;
        let mut pool = MailboxPool {
            mailbox,
            buffers: Vec::with_capacity(3),
        };

        // Relax the flags until the firmware accepts the allocation.
        let flag_options = [
            MEM_FLAG_COHERENT | MEM_FLAG_DIRECT | MEM_FLAG_ZERO,
            MEM_FLAG_COHERENT | MEM_FLAG_DIRECT,
            MEM_FLAG_COHERENT,
        ];

        for _ in 0..3 {
            let mut handle = None;
            for flags in flag_options {
                if let Ok(h) = pool.mailbox.allocate(buffer_size as u32, PAGE_SIZE as u32, flags)
                {
                    handle = Some(h);
                    break;
                }
            }
            let handle = handle.ok_or_else(|| {
                io::Error::new(io::ErrorKind::OutOfMemory, "mailbox allocate failed")
            })?;

            let bus_addr = match pool.mailbox.lock(handle) {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = pool.mailbox.release(handle);
                    return Err(e);
                }
            };

            let mapping = match pool.mailbox.map_bus_address(bus_addr, buffer_size) {
                Ok(mapping) => mapping,
                Err(e) => {
                    let _ = pool.mailbox.unlock(handle);
                    let _ = pool.mailbox.release(handle);
                    return Err(e);
                }
            };

            pool.buffers.push(MailboxBuffer {
                handle,
                bus_addr,
                mapping: Some(mapping),
            });
        }

        let bus_addrs = [
            pool.buffers[0].bus_addr,
            pool.buffers[1].bus_addr,
            pool.buffers[2].bus_addr,
        ];
        let ptrs = [
            NonNull::new(pool.buffers[0].mapping.as_ref().unwrap().data_ptr()).unwrap(),
            NonNull::new(pool.buffers[1].mapping.as_ref().unwrap().data_ptr()).unwrap(),
            NonNull::new(pool.buffers[2].mapping.as_ref().unwrap().data_ptr()).unwrap(),
        ];
        tracing::info!(
            buffer_size,
            bus_addrs = ?bus_addrs.map(|a| format!("{a:#010x}")),
            "allocated frame buffers from VideoCore mailbox"
        );
        Ok(DmaBufferPool {
            frame_bytes,
            buffer_size,
            bus_addrs,
            ptrs,
            strategy: PoolStrategy::Mailbox,
            _backing: Backing::Mailbox(pool),
        })
    }

    fn allocate_cpu(frame_bytes: usize, buffer_size: usize) -> io::Result<Self> {
        let mut buffers = Vec::with_capacity(3);
        for _ in 0..3 {
            let map = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    buffer_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            buffers.push(CpuBuffer {
                map: NonNull::new(map as *mut u8).unwrap(),
                len: buffer_size,
            });
        }
        let ptrs = [buffers[0].map, buffers[1].map, buffers[2].map];
        tracing::info!(buffer_size, "allocated plain CPU frame buffers (no DMA)");
        Ok(DmaBufferPool {
            frame_bytes,
            buffer_size,
            bus_addrs: [0; 3],
            ptrs,
            strategy: PoolStrategy::Cpu,
            _backing: Backing::Cpu(buffers),
        })
    }

    #[inline]
    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    /// Usable frame bytes per buffer (`width * height * 3`).
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Allocated (page-aligned) size per buffer.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bus addresses of the three buffers, zero when not DMA-capable.
    #[inline]
    pub fn bus_addrs(&self) -> [u32; 3] {
        self.bus_addrs
    }

    /// Hardware rotation needs all three buffers reachable from the DMA
    /// engine.
    #[inline]
    pub fn can_dma_rotate(&self) -> bool {
        self.bus_addrs.iter().all(|&a| a != 0)
    }

    /// Frame view of buffer `index`.
    ///
    /// # Safety
    ///
    /// The caller must ensure no concurrent mutable access to the same
    /// buffer; the frame loop guarantees this through the role permutation
    /// (SPI reads front, rotation writes back, the copy-in writes pending).
    pub unsafe fn buffer(&self, index: usize) -> &[u8] {
        std::slice::from_raw_parts(self.ptrs[index].as_ptr(), self.frame_bytes)
    }

    /// Mutable frame view of buffer `index`.
    ///
    /// # Safety
    ///
    /// Same disjointness requirement as [`Self::buffer`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_mut(&self, index: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptrs[index].as_ptr(), self.frame_bytes)
    }
}

fn open_any_dma_heap() -> io::Result<OwnedFd> {
    for name in DMA_HEAP_CANDIDATES {
        if let Ok(fd) = open_dma_heap(name) {
            tracing::debug!(heap = name, "opened dma-heap");
            return Ok(fd);
        }
    }
    // Any heap is better than none; scan the directory.
    for entry in std::fs::read_dir("/dev/dma_heap")?.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                if let Ok(fd) = open_dma_heap(name) {
                    tracing::debug!(heap = name, "opened dma-heap");
                    return Ok(fd);
                }
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no usable dma-heap under /dev/dma_heap",
    ))
}

fn open_dma_heap(name: &str) -> io::Result<OwnedFd> {
    let path = std::ffi::CString::new(format!("/dev/dma_heap/{name}"))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid heap name"))?;
    let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn alloc_dma_heap_buffer(heap: &OwnedFd, len: usize) -> io::Result<CmaBuffer> {
    let mut data = DmaHeapAllocationData {
        len: len as u64,
        fd: 0,
        fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
        heap_flags: 0,
    };
    let rc = unsafe { libc::ioctl(heap.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC, &mut data) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let dmabuf = unsafe { OwnedFd::from_raw_fd(data.fd as i32) };

    let map = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            dmabuf.as_raw_fd(),
            0,
        )
    };
    if map == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(CmaBuffer {
        map: NonNull::new(map as *mut u8).unwrap(),
        len,
        dmabuf,
    })
}

fn vcsm_import(vcsm: &OwnedFd, dmabuf: &OwnedFd) -> io::Result<u32> {
    let mut data = VcsmImportDmabuf {
        dmabuf_fd: dmabuf.as_raw_fd(),
        cached: 0,
        name: *b"ili9488_fb\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0",
        handle: 0,
        vc_handle: 0,
        size: 0,
        pad: 0,
        dma_addr: 0,
    };
    let rc = unsafe {
        libc::ioctl(
            vcsm.as_raw_fd(),
            VCSM_CMA_IOCTL_MEM_IMPORT_DMABUF,
            &mut data,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if data.dma_addr == 0 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "vcsm-cma import returned no dma address",
        ));
    }
    Ok(data.dma_addr as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_pool_geometry() {
        let pool = DmaBufferPool::allocate_cpu_only(320, 240).unwrap();
        assert_eq!(pool.strategy(), PoolStrategy::Cpu);
        assert_eq!(pool.frame_bytes(), 320 * 240 * 3);
        // Allocation is page-aligned and covers the frame.
        assert_eq!(pool.buffer_size() % PAGE_SIZE, 0);
        assert!(pool.buffer_size() >= pool.frame_bytes());
        assert_eq!(pool.bus_addrs(), [0; 3]);
        assert!(!pool.can_dma_rotate());
    }

    #[test]
    fn cpu_buffers_are_distinct_and_writable() {
        let pool = DmaBufferPool::allocate_cpu_only(16, 16).unwrap();
        for i in 0..3 {
            // SAFETY: test is the only accessor.
            let buf = unsafe { pool.buffer_mut(i) };
            buf.fill(i as u8 + 1);
        }
        for i in 0..3 {
            let buf = unsafe { pool.buffer(i) };
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[test]
    fn ioctl_encodings() {
        assert_eq!(
            DMA_HEAP_IOCTL_ALLOC,
            ioc::iowr(b'H' as u32, 0, 24),
        );
        assert_eq!(std::mem::size_of::<VcsmImportDmabuf>(), 64);
    }
}
