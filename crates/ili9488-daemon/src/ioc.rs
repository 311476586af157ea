//! Linux `_IOC` ioctl request encoding.
//!
//! The asm-generic encoding used by every device this daemon talks to:
//! two direction bits, a 14-bit argument size, an 8-bit type and an 8-bit
//! number. The libc crate only ships a handful of pre-encoded requests, so
//! the spidev/gpio/dma-heap/vcsm/vcio requests are built here.

const NRBITS: u32 = 8;
const TYPEBITS: u32 = 8;
const SIZEBITS: u32 = 14;

const NRSHIFT: u32 = 0;
const TYPESHIFT: u32 = NRSHIFT + NRBITS;
const SIZESHIFT: u32 = TYPESHIFT + TYPEBITS;
const DIRSHIFT: u32 = SIZESHIFT + SIZEBITS;

const NONE: u32 = 0;
const WRITE: u32 = 1;
const READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << DIRSHIFT) | (ty << TYPESHIFT) | (nr << NRSHIFT) | ((size as u32) << SIZESHIFT))
        as libc::c_ulong
}

pub const fn io(ty: u32, nr: u32) -> libc::c_ulong {
    ioc(NONE, ty, nr, 0)
}

pub const fn iow(ty: u32, nr: u32, size: usize) -> libc::c_ulong {
    ioc(WRITE, ty, nr, size)
}

pub const fn ior(ty: u32, nr: u32, size: usize) -> libc::c_ulong {
    ioc(READ, ty, nr, size)
}

pub const fn iowr(ty: u32, nr: u32, size: usize) -> libc::c_ulong {
    ioc(READ | WRITE, ty, nr, size)
}
