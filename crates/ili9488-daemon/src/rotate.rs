//! The rotation stage: copy pending -> back with an optional quarter- or
//! half-turn.
//!
//! The preferred path programs a single 2D transfer on a BCM DMA channel.
//! The 2D descriptor cannot express a reflection, so 180 degrees always
//! takes the CPU path; 90/270 fall back to a cache-friendly 8x8 tiled
//! transpose whenever the hardware path is missing or times out.

use std::time::{Duration, Instant};

use crate::config::Rotation;
use crate::peripheral::MmioRegion;

/// DMA channel owned by the rotation stage while the daemon runs.
pub const ROTATE_DMA_CHANNEL: u32 = 7;

// Register byte offsets within a DMA channel block.
const DMA_CS: usize = 0x00;
const DMA_TI: usize = 0x08;
const DMA_SOURCE_AD: usize = 0x0C;
const DMA_DEST_AD: usize = 0x10;
const DMA_LEN: usize = 0x14;
const DMA_STRIDE: usize = 0x18;

const CS_ACTIVE: u32 = 1 << 0;
const CS_RESET: u32 = 1 << 31;

const TI_2D: u32 = 1 << 1;
const TI_DEST_INC: u32 = 1 << 4;
const TI_SRC_INC: u32 = 1 << 8;
const TI_WAIT_WRITE_RESP: u32 = 1 << 28;

const BYTES_PER_PIXEL: usize = 3;

/// How long a single 2D transfer may run before the channel is reset.
const DMA_DEADLINE: Duration = Duration::from_secs(1);
const DMA_POLL: Duration = Duration::from_millis(1);

/// Rotation engine: hardware 2D DMA when the channel registers are mapped,
/// CPU copies otherwise.
pub enum RotateEngine {
    Hw { regs: MmioRegion },
    CpuOnly,
}

impl RotateEngine {
    /// Build the engine, resetting the channel when hardware is available.
    pub fn new(regs: Option<MmioRegion>) -> Self {
        match regs {
            Some(regs) => {
                regs.write(DMA_CS, CS_RESET);
                std::thread::sleep(Duration::from_micros(10));
                regs.write(DMA_CS, 0);
                tracing::info!(channel = ROTATE_DMA_CHANNEL, "hardware rotation enabled");
                RotateEngine::Hw { regs }
            }
            None => {
                tracing::info!("hardware rotation unavailable, CPU fallback only");
                RotateEngine::CpuOnly
            }
        }
    }

    #[inline]
    pub fn hw_available(&self) -> bool {
        matches!(self, RotateEngine::Hw { .. })
    }

    /// Copy `src` (a `width x height` frame) into `dst`, rotated.
    ///
    /// Attempts the DMA path for quarter turns when both bus addresses are
    /// known; any hardware failure falls back to the CPU rotator. Half
    /// turns and the identity never touch the hardware.
    pub fn rotate(
        &self,
        src: &[u8],
        src_bus_addr: u32,
        dst: &mut [u8],
        dst_bus_addr: u32,
        width: u32,
        height: u32,
        rotation: Rotation,
    ) {
        debug_assert_eq!(src.len(), width as usize * height as usize * BYTES_PER_PIXEL);
        debug_assert_eq!(src.len(), dst.len());

        // The 2D descriptor only expresses positive strides, which cannot
        // reflect; 180 degrees goes straight to the CPU path.
        if matches!(rotation, Rotation::Deg90 | Rotation::Deg270)
            && src_bus_addr != 0
            && dst_bus_addr != 0
        {
            if let RotateEngine::Hw { regs } = self {
                match hw_rotate_2d(regs, src_bus_addr, dst_bus_addr, width, height) {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "DMA rotation failed, using CPU fallback");
                    }
                }
            }
        }

        rotate_cpu(src, dst, width, height, rotation);
    }
}

/// Program and wait for one 2D transfer.
fn hw_rotate_2d(
    regs: &MmioRegion,
    src_bus_addr: u32,
    dst_bus_addr: u32,
    width: u32,
    height: u32,
) -> Result<(), HwRotateError> {
    // Quarter turns transpose the geometry: rows of the destination are
    // columns of the source.
    let xlen = height * BYTES_PER_PIXEL as u32;
    let ylen = width;

    regs.write(DMA_SOURCE_AD, src_bus_addr);
    regs.write(DMA_DEST_AD, dst_bus_addr);
    regs.write(DMA_LEN, xlen * ylen);
    regs.write(DMA_STRIDE, ((ylen - 1) << 16) | (xlen & 0xFFFF));
    regs.write(
        DMA_TI,
        TI_SRC_INC | TI_DEST_INC | TI_2D | TI_WAIT_WRITE_RESP,
    );
    regs.write(DMA_CS, CS_ACTIVE);

    let start = Instant::now();
    while regs.read(DMA_CS) & CS_ACTIVE != 0 {
        if start.elapsed() > DMA_DEADLINE {
            regs.write(DMA_CS, CS_RESET);
            return Err(HwRotateError::Timeout);
        }
        std::thread::sleep(DMA_POLL);
    }
    Ok(())
}

#[derive(Debug)]
pub enum HwRotateError {
    /// The channel did not go idle within the deadline; it has been reset.
    Timeout,
}

impl std::fmt::Display for HwRotateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "DMA transfer exceeded 1s deadline"),
        }
    }
}

impl std::error::Error for HwRotateError {}

impl Drop for RotateEngine {
    fn drop(&mut self) {
        if let RotateEngine::Hw { regs } = self {
            regs.write(DMA_CS, CS_RESET);
        }
    }
}

/// CPU rotation dispatch.
pub fn rotate_cpu(src: &[u8], dst: &mut [u8], width: u32, height: u32, rotation: Rotation) {
    match rotation {
        Rotation::Deg0 => dst.copy_from_slice(src),
        Rotation::Deg90 => rotate90_tiled(src, dst, width, height),
        Rotation::Deg180 => rotate180(src, dst, width, height),
        Rotation::Deg270 => rotate270_tiled(src, dst, width, height),
    }
}

const TILE: u32 = 8;

/// 90 degrees clockwise, 8x8 tiles so destination rows are written in runs
/// that stay inside one cache line per tile column.
fn rotate90_tiled(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    let dst_width = height;

    for tile_y in (0..height).step_by(TILE as usize) {
        for tile_x in (0..width).step_by(TILE as usize) {
            let tile_h = TILE.min(height - tile_y);
            let tile_w = TILE.min(width - tile_x);

            for y in 0..tile_h {
                let src_y = tile_y + y;
                for x in 0..tile_w {
                    let src_x = tile_x + x;
                    let dst_x = dst_width - 1 - src_y;
                    let dst_y = src_x;

                    let src_idx = (src_y as usize * width as usize + src_x as usize) * 3;
                    let dst_idx = (dst_y as usize * dst_width as usize + dst_x as usize) * 3;
                    dst[dst_idx..dst_idx + 3].copy_from_slice(&src[src_idx..src_idx + 3]);
                }
            }
        }
    }
}

/// 270 degrees clockwise (90 counter-clockwise), same tiling.
fn rotate270_tiled(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    let dst_width = height;
    let dst_height = width;

    for tile_y in (0..height).step_by(TILE as usize) {
        for tile_x in (0..width).step_by(TILE as usize) {
            let tile_h = TILE.min(height - tile_y);
            let tile_w = TILE.min(width - tile_x);

            for y in 0..tile_h {
                let src_y = tile_y + y;
                for x in 0..tile_w {
                    let src_x = tile_x + x;
                    let dst_x = src_y;
                    let dst_y = dst_height - 1 - src_x;

                    let src_idx = (src_y as usize * width as usize + src_x as usize) * 3;
                    let dst_idx = (dst_y as usize * dst_width as usize + dst_x as usize) * 3;
                    dst[dst_idx..dst_idx + 3].copy_from_slice(&src[src_idx..src_idx + 3]);
                }
            }
        }
    }
}

/// 180 degrees: read pixels back-to-front in 4-pixel blocks, write
/// front-to-back.
fn rotate180(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    let total_pixels = width as usize * height as usize;
    let blocks = total_pixels & !3;

    let mut dst_off = 0;
    for i in (0..blocks).step_by(4) {
        let s = (total_pixels - i - 4) * 3;
        dst[dst_off] = src[s + 9];
        dst[dst_off + 1] = src[s + 10];
        dst[dst_off + 2] = src[s + 11];
        dst[dst_off + 3] = src[s + 6];
        dst[dst_off + 4] = src[s + 7];
        dst[dst_off + 5] = src[s + 8];
        dst[dst_off + 6] = src[s + 3];
        dst[dst_off + 7] = src[s + 4];
        dst[dst_off + 8] = src[s + 5];
        dst[dst_off + 9] = src[s];
        dst[dst_off + 10] = src[s + 1];
        dst[dst_off + 11] = src[s + 2];
        dst_off += 12;
    }
    for i in blocks..total_pixels {
        let s = (total_pixels - i - 1) * 3;
        dst[dst_off..dst_off + 3].copy_from_slice(&src[s..s + 3]);
        dst_off += 3;
    }
}
