//! SoC peripheral discovery and scoped MMIO windows.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// Peripheral base on the original BCM2835; newer SoCs publish theirs in the
/// device tree.
pub const BCM2835_PERIPH_BASE: u32 = 0x2000_0000;

/// DMA controller block, relative to the peripheral base.
pub const DMA_BASE_OFFSET: u32 = 0x7000;

/// SPI0 block, relative to the peripheral base.
pub const SPI0_BASE_OFFSET: u32 = 0x20_4000;

/// Register stride between DMA channels.
pub const DMA_CHANNEL_STRIDE: u32 = 0x100;

pub const PAGE_SIZE: usize = 4096;

/// Read the SoC peripheral base from the device tree.
///
/// `/proc/device-tree/soc/ranges` starts with two big-endian 32-bit words;
/// the second is the CPU-visible base of the peripheral window. Falls back
/// to the BCM2835 base when the file is missing or unreadable.
pub fn peripheral_base() -> u32 {
    match std::fs::read("/proc/device-tree/soc/ranges") {
        Ok(ranges) if ranges.len() >= 8 => {
            let base = u32::from_be_bytes([ranges[4], ranges[5], ranges[6], ranges[7]]);
            if base != 0 {
                base
            } else {
                BCM2835_PERIPH_BASE
            }
        }
        _ => BCM2835_PERIPH_BASE,
    }
}

/// One 4 KiB `/dev/mem` register window.
///
/// Register access is volatile and 32-bit; the window is unmapped on drop.
pub struct MmioRegion {
    map: NonNull<u8>,
    regs: NonNull<u32>,
    _mem: OwnedFd,
}

// SAFETY: register reads/writes are volatile and the hardware tolerates any
// interleaving; exclusive ownership of a channel is enforced by construction
// (one RotateEngine per daemon).
unsafe impl Send for MmioRegion {}

impl MmioRegion {
    /// Map the page containing `phys_addr` and aim the register pointer at
    /// the exact address.
    pub fn map(phys_addr: u32) -> io::Result<Self> {
        let raw = unsafe {
            libc::open(
                c"/dev/mem".as_ptr(),
                libc::O_RDWR | libc::O_SYNC | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let mem = unsafe { OwnedFd::from_raw_fd(raw) };

        let page_base = phys_addr & !(PAGE_SIZE as u32 - 1);
        let offset = (phys_addr - page_base) as usize;

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                page_base as libc::off_t,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let map = NonNull::new(map as *mut u8).unwrap();
        let regs = NonNull::new(unsafe { map.as_ptr().add(offset) } as *mut u32).unwrap();
        Ok(MmioRegion {
            map,
            regs,
            _mem: mem,
        })
    }

    /// Read the 32-bit register at byte offset `reg`.
    #[inline]
    pub fn read(&self, reg: usize) -> u32 {
        debug_assert!(reg % 4 == 0);
        unsafe { std::ptr::read_volatile(self.regs.as_ptr().add(reg / 4)) }
    }

    /// Write the 32-bit register at byte offset `reg`.
    #[inline]
    pub fn write(&self, reg: usize, value: u32) {
        debug_assert!(reg % 4 == 0);
        unsafe { std::ptr::write_volatile(self.regs.as_ptr().add(reg / 4), value) }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr() as *mut libc::c_void, PAGE_SIZE);
        }
    }
}

/// The MMIO windows the daemon may program directly: the rotation DMA
/// channel, and (reserved for the direct-SPI path) the SPI0 block.
pub struct PeripheralMap {
    pub dma: MmioRegion,
    pub spi: Option<MmioRegion>,
}

impl PeripheralMap {
    /// Map the register windows for `dma_channel`.
    ///
    /// Returns `None` when `/dev/mem` is unavailable (no root, or
    /// `iomem=relaxed` not set); the caller degrades to CPU rotation and the
    /// plain spidev path.
    pub fn probe(dma_channel: u32) -> Option<Self> {
        let base = peripheral_base();
        let dma_addr = base + DMA_BASE_OFFSET + dma_channel * DMA_CHANNEL_STRIDE;

        let dma = match MmioRegion::map(dma_addr) {
            Ok(region) => region,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    periph_base = format_args!("{base:#010x}"),
                    "no direct DMA: cannot map DMA controller registers"
                );
                return None;
            }
        };

        // SPI0 registers are only needed by the (disabled) direct-DMA SPI
        // path; missing them is not a reason to give up hardware rotation.
        let spi = match MmioRegion::map(base + SPI0_BASE_OFFSET) {
            Ok(region) => Some(region),
            Err(e) => {
                tracing::debug!(error = %e, "SPI0 register window unavailable");
                None
            }
        };

        tracing::info!(
            periph_base = format_args!("{base:#010x}"),
            dma_channel,
            "mapped peripheral registers"
        );
        Some(PeripheralMap { dma, spi })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_base_is_bcm2835() {
        // On a dev machine without /proc/device-tree this must not panic and
        // must return the historical default; on a Pi it returns the DT
        // value, which is never zero.
        let base = peripheral_base();
        assert_ne!(base, 0);
    }

    #[test]
    fn dma_channel_addresses() {
        let base = BCM2835_PERIPH_BASE;
        assert_eq!(base + DMA_BASE_OFFSET + 7 * DMA_CHANNEL_STRIDE, 0x2000_7700);
        assert_eq!(base + SPI0_BASE_OFFSET, 0x2020_4000);
    }
}
