//! VideoCore property mailbox on `/dev/vcio`.
//!
//! Used as the second-choice allocator for the frame buffers: ask the GPU
//! firmware for contiguous memory, lock it to learn the bus address, then
//! map the physical alias through `/dev/mem`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::ioc;
use crate::peripheral::PAGE_SIZE;

const MBOX_TAG_ALLOCATE_MEMORY: u32 = 0x0003_000c;
const MBOX_TAG_LOCK_MEMORY: u32 = 0x0003_000d;
const MBOX_TAG_UNLOCK_MEMORY: u32 = 0x0003_000e;
const MBOX_TAG_RELEASE_MEMORY: u32 = 0x0003_000f;
const MBOX_TAG_LAST: u32 = 0;

const MBOX_REQUEST: u32 = 0;

pub const MEM_FLAG_DIRECT: u32 = 1 << 2;
pub const MEM_FLAG_COHERENT: u32 = 1 << 3;
pub const MEM_FLAG_ZERO: u32 = 1 << 4;

/// Masking a bus address with this recovers the physical address.
pub const BUS_ADDRESS_MASK: u32 = 0x3FFF_FFFF;

/// `_IOWR(100, 0, char*)` — the property-channel ioctl.
const MBOX_PROPERTY: libc::c_ulong =
    ioc::iowr(100, 0, std::mem::size_of::<*mut libc::c_char>());

/// Property-channel message buffer. The firmware requires 16-byte alignment.
#[repr(C, align(16))]
struct PropertyMessage {
    size: u32,
    request: u32,
    tags: [u32; 32],
}

impl PropertyMessage {
    fn new() -> Self {
        PropertyMessage {
            size: std::mem::size_of::<PropertyMessage>() as u32,
            request: MBOX_REQUEST,
            tags: [0; 32],
        }
    }
}

/// Open handles to `/dev/vcio` and `/dev/mem`.
pub struct Mailbox {
    vcio: OwnedFd,
    mem: OwnedFd,
}

impl Mailbox {
    pub fn open() -> io::Result<Self> {
        let vcio = open_cloexec(c"/dev/vcio", libc::O_RDWR)?;
        let mem = open_cloexec(c"/dev/mem", libc::O_RDWR | libc::O_SYNC)?;
        Ok(Mailbox { vcio, mem })
    }

    fn property(&self, msg: &mut PropertyMessage) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.vcio.as_raw_fd(), MBOX_PROPERTY, msg as *mut _) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Allocate GPU memory; returns the firmware handle.
    pub fn allocate(&self, size: u32, align: u32, flags: u32) -> io::Result<u32> {
        let mut msg = PropertyMessage::new();
        msg.tags[0] = MBOX_TAG_ALLOCATE_MEMORY;
        msg.tags[1] = 12;
        msg.tags[2] = 12;
        msg.tags[3] = size;
        msg.tags[4] = align;
        msg.tags[5] = flags;
        msg.tags[6] = MBOX_TAG_LAST;
        self.property(&mut msg)?;
        match msg.tags[3] {
            0 => Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "mailbox allocate returned null handle",
            )),
            handle => Ok(handle),
        }
    }

    /// Pin an allocation; returns its bus address.
    pub fn lock(&self, handle: u32) -> io::Result<u32> {
        let mut msg = PropertyMessage::new();
        msg.tags[0] = MBOX_TAG_LOCK_MEMORY;
        msg.tags[1] = 4;
        msg.tags[2] = 4;
        msg.tags[3] = handle;
        msg.tags[4] = MBOX_TAG_LAST;
        self.property(&mut msg)?;
        match msg.tags[3] {
            0 => Err(io::Error::new(
                io::ErrorKind::Other,
                "mailbox lock returned null bus address",
            )),
            bus_addr => Ok(bus_addr),
        }
    }

    pub fn unlock(&self, handle: u32) -> io::Result<()> {
        let mut msg = PropertyMessage::new();
        msg.tags[0] = MBOX_TAG_UNLOCK_MEMORY;
        msg.tags[1] = 4;
        msg.tags[2] = 4;
        msg.tags[3] = handle;
        msg.tags[4] = MBOX_TAG_LAST;
        self.property(&mut msg)
    }

    pub fn release(&self, handle: u32) -> io::Result<()> {
        let mut msg = PropertyMessage::new();
        msg.tags[0] = MBOX_TAG_RELEASE_MEMORY;
        msg.tags[1] = 4;
        msg.tags[2] = 4;
        msg.tags[3] = handle;
        msg.tags[4] = MBOX_TAG_LAST;
        self.property(&mut msg)
    }

    /// Map the physical memory behind a bus address read-write.
    pub fn map_bus_address(&self, bus_addr: u32, len: usize) -> io::Result<BusMapping> {
        BusMapping::map(&self.mem, bus_addr, len, libc::PROT_READ | libc::PROT_WRITE)
    }
}

/// A page-rounded `/dev/mem` mapping of a bus-addressed region.
pub struct BusMapping {
    base: NonNull<u8>,
    map_len: usize,
    offset: usize,
}

// SAFETY: plain memory mapping; aliasing with the GPU is the whole point.
unsafe impl Send for BusMapping {}

impl BusMapping {
    pub(crate) fn map(
        mem: &OwnedFd,
        bus_addr: u32,
        len: usize,
        prot: libc::c_int,
    ) -> io::Result<Self> {
        let phys = bus_addr & BUS_ADDRESS_MASK;
        let page_base = phys & !(PAGE_SIZE as u32 - 1);
        let offset = (phys - page_base) as usize;
        let map_len = (len + offset + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                prot,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                page_base as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(BusMapping {
            base: NonNull::new(base as *mut u8).unwrap(),
            map_len,
            offset,
        })
    }

    /// Pointer to the first byte of the requested region.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.offset) }
    }
}

impl Drop for BusMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

pub(crate) fn open_cloexec(path: &std::ffi::CStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}
