//! Cross-process arena header layout.
//!
//! The `repr(C)` header sits at offset 0 of the shared-memory region and is
//! the entire wire contract between daemon and producers. Immediately after
//! it lie three packed `width * height * 3`-byte framebuffers. All
//! mutable-after-init fields are atomics; the geometry fields are written
//! once by the daemon before `daemon_ready` is raised and read-only
//! afterwards.

use std::sync::atomic::{AtomicU32, Ordering};

/// Magic identifying an ili9488 triple-buffer region ("II L9").
pub const ARENA_MAGIC: u32 = 0x4949_4C39;

/// Current header version.
pub const ARENA_VERSION: u32 = 1;

/// The data plane is packed RGB666-in-RGB888: three bytes per pixel.
pub const BYTES_PER_PIXEL: u32 = 3;

/// Shared arena header.
///
/// The three bus-address slots always describe the buffers *currently
/// occupying* the front/back/pending roles, in that order; the daemon
/// republishes them after every role rotation so a remote DMA master reading
/// the header sees a stable role-to-bus-address mapping.
#[repr(C)]
pub struct ArenaHeader {
    pub magic: u32,
    pub version: u32,

    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,

    /// Bus address of the buffer holding the front role.
    pub front_bus_addr: AtomicU32,
    /// Bus address of the buffer holding the back role.
    pub back_bus_addr: AtomicU32,
    /// Bus address of the buffer holding the pending role.
    pub pending_bus_addr: AtomicU32,

    pub front_index: AtomicU32,
    pub back_index: AtomicU32,
    pub pending_index: AtomicU32,

    /// Guards the pending buffer. Initial value 1, process-shared.
    pub pending_sem: libc::sem_t,

    /// Incremented by the producer after each completed frame write.
    pub frame_counter: AtomicU32,
    /// Producer-facing rotation in degrees; the daemon reads it per frame.
    pub rotation_degrees: AtomicU32,

    pub daemon_ready: AtomicU32,
    pub app_connected: AtomicU32,

    pub _pad: [u8; 64],
}

// Cache-line padded: producers and the daemon hammer different fields.
const _: () = assert!(std::mem::size_of::<ArenaHeader>() >= 128);

impl ArenaHeader {
    /// Initialize a freshly created header. The semaphore is initialized
    /// separately by the arena, after this returns.
    pub fn init(&mut self, width: u32, height: u32, bus_addrs: [u32; 3]) {
        self.magic = ARENA_MAGIC;
        self.version = ARENA_VERSION;
        self.width = width;
        self.height = height;
        self.bytes_per_pixel = BYTES_PER_PIXEL;
        self.front_bus_addr = AtomicU32::new(bus_addrs[0]);
        self.back_bus_addr = AtomicU32::new(bus_addrs[1]);
        self.pending_bus_addr = AtomicU32::new(bus_addrs[2]);
        self.front_index = AtomicU32::new(0);
        self.back_index = AtomicU32::new(1);
        self.pending_index = AtomicU32::new(2);
        self.frame_counter = AtomicU32::new(0);
        self.rotation_degrees = AtomicU32::new(0);
        self.daemon_ready = AtomicU32::new(0);
        self.app_connected = AtomicU32::new(0);
        self._pad = [0; 64];
    }

    /// Validate a header mapped from an existing region (producer side).
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.magic != ARENA_MAGIC {
            return Err(LayoutError::BadMagic { found: self.magic });
        }
        if self.version != ARENA_VERSION {
            return Err(LayoutError::UnsupportedVersion {
                expected: ARENA_VERSION,
                found: self.version,
            });
        }
        if self.bytes_per_pixel != BYTES_PER_PIXEL {
            return Err(LayoutError::InvalidGeometry("bytes_per_pixel must be 3"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(LayoutError::InvalidGeometry("zero width or height"));
        }
        Ok(())
    }

    /// Size in bytes of one framebuffer described by this header.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel as usize
    }

    /// Snapshot of the role indices `(front, back, pending)`.
    #[inline]
    pub fn role_indices(&self) -> (u32, u32, u32) {
        (
            self.front_index.load(Ordering::Acquire),
            self.back_index.load(Ordering::Acquire),
            self.pending_index.load(Ordering::Acquire),
        )
    }
}

/// Total region size for the given framebuffer geometry.
pub fn region_size(width: u32, height: u32) -> usize {
    std::mem::size_of::<ArenaHeader>()
        + 3 * width as usize * height as usize * BYTES_PER_PIXEL as usize
}

/// Errors from validating a mapped header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// The region does not start with the arena magic.
    BadMagic { found: u32 },
    /// Header version mismatch.
    UnsupportedVersion { expected: u32, found: u32 },
    /// Geometry fields are inconsistent.
    InvalidGeometry(&'static str),
    /// The mapped region is smaller than the header claims.
    RegionTooSmall { required: usize, found: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "bad arena magic: {found:#010x} (expected {ARENA_MAGIC:#010x})")
            }
            Self::UnsupportedVersion { expected, found } => {
                write!(f, "unsupported arena version {found} (expected {expected})")
            }
            Self::InvalidGeometry(msg) => write!(f, "invalid geometry: {msg}"),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {required} bytes, got {found}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_header() -> Box<ArenaHeader> {
        // SAFETY: every field of ArenaHeader is valid when zeroed; init()
        // overwrites them all before use.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn header_is_cache_line_padded() {
        assert!(std::mem::size_of::<ArenaHeader>() >= 128);
    }

    #[test]
    fn init_then_validate() {
        let mut header = zeroed_header();
        header.init(320, 240, [0x4000_0000, 0x4010_0000, 0x4020_0000]);

        assert!(header.validate().is_ok());
        assert_eq!(header.magic, ARENA_MAGIC);
        assert_eq!(header.version, 1);
        assert_eq!(header.bytes_per_pixel, 3);
        assert_eq!(header.role_indices(), (0, 1, 2));
        assert_eq!(header.frame_bytes(), 320 * 240 * 3);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut header = zeroed_header();
        header.init(320, 240, [0; 3]);
        header.magic = 0xDEAD_BEEF;
        assert_eq!(
            header.validate(),
            Err(LayoutError::BadMagic { found: 0xDEAD_BEEF })
        );
    }

    #[test]
    fn validate_rejects_version_mismatch() {
        let mut header = zeroed_header();
        header.init(320, 240, [0; 3]);
        header.version = 2;
        assert!(matches!(
            header.validate(),
            Err(LayoutError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn region_size_matches_layout() {
        assert_eq!(
            region_size(320, 240),
            std::mem::size_of::<ArenaHeader>() + 3 * 320 * 240 * 3
        );
    }
}
