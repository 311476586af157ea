//! Daemon configuration: CLI flags, environment fallbacks and the derived
//! framebuffer geometry.

use clap::Parser;

/// Rotation applied between the producer framebuffer and the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    #[inline]
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one.
    #[inline]
    pub fn inverse(self) -> Self {
        match self {
            Self::Deg0 => Self::Deg0,
            Self::Deg90 => Self::Deg270,
            Self::Deg180 => Self::Deg180,
            Self::Deg270 => Self::Deg90,
        }
    }

    /// Whether this rotation swaps the two axes.
    #[inline]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Command-line options. Every flag can also come from the matching
/// `ILI9488_*` environment variable; flags win.
#[derive(Debug, Parser)]
#[command(name = "ili9488d", about = "ILI9488 SPI display daemon")]
pub struct Options {
    /// POSIX shared-memory name (a leading `/` is added if absent).
    #[arg(long, env = "ILI9488_SHM_NAME")]
    pub shm: String,

    /// Panel width in pixels.
    #[arg(long, env = "ILI9488_WIDTH")]
    pub width: u32,

    /// Panel height in pixels.
    #[arg(long, env = "ILI9488_HEIGHT")]
    pub height: u32,

    /// Producer rotation in degrees: 0, 90, 180 or 270.
    #[arg(long, env = "ILI9488_ROTATION", default_value_t = 0)]
    pub rotation: u32,

    /// Draw an FPS readout onto outgoing frames (0 or 1).
    #[arg(long, env = "ILI9488_FPS_OVERLAY", default_value_t = 1)]
    pub fps_overlay: u8,

    /// Frame pacing cap; 0 means unlimited.
    #[arg(long, env = "ILI9488_MAX_FPS", default_value_t = 20)]
    pub max_fps: u32,

    /// spidev device node.
    #[arg(long, env = "ILI9488_SPI_DEVICE", default_value = "/dev/spidev0.0")]
    pub spi_device: String,

    /// SPI clock during frame streaming.
    #[arg(long, env = "ILI9488_SPI_HZ", default_value_t = 65_000_000)]
    pub spi_hz: u32,

    /// Slower SPI clock used for panel initialization.
    #[arg(long, env = "ILI9488_SPI_INIT_HZ", default_value_t = 4_000_000)]
    pub spi_init_hz: u32,

    /// BCM GPIO number of the data/command line.
    #[arg(long, env = "ILI9488_DC_GPIO", default_value_t = 24)]
    pub dc_gpio: u32,

    /// BCM GPIO number of the panel reset line.
    #[arg(long, env = "ILI9488_RESET_GPIO", default_value_t = 25)]
    pub reset_gpio: u32,

    /// Largest single spidev transfer when streaming pixels.
    #[arg(long, env = "ILI9488_CHUNK_BYTES", default_value_t = 65_536)]
    pub chunk_bytes: usize,
}

impl Options {
    /// Reject configurations before any hardware is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("width and height must be non-zero".into());
        }
        if Rotation::from_degrees(self.rotation).is_none() {
            return Err(format!(
                "rotation must be 0, 90, 180 or 270 (got {})",
                self.rotation
            ));
        }
        if self.fps_overlay > 1 {
            return Err("fps-overlay must be 0 or 1".into());
        }
        if self.chunk_bytes == 0 {
            return Err("chunk-bytes must be non-zero".into());
        }
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        let rotation = Rotation::from_degrees(self.rotation).expect("validated rotation");
        Geometry::derive(self.width, self.height, rotation)
    }
}

/// Panel and framebuffer dimensions plus the rotation the daemon applies.
///
/// When the producer rotation swaps axes, the producer renders at
/// `height x width` and the daemon rotates by the inverse angle to land on
/// panel orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub panel_width: u32,
    pub panel_height: u32,
    pub fb_width: u32,
    pub fb_height: u32,
    /// Producer-facing rotation (what goes into the arena header).
    pub producer_rotation: Rotation,
    /// Rotation the daemon applies on the pending-to-back copy.
    pub applied_rotation: Rotation,
}

impl Geometry {
    pub fn derive(panel_width: u32, panel_height: u32, rotation: Rotation) -> Self {
        let (fb_width, fb_height) = if rotation.swaps_axes() {
            (panel_height, panel_width)
        } else {
            (panel_width, panel_height)
        };
        Geometry {
            panel_width,
            panel_height,
            fb_width,
            fb_height,
            producer_rotation: rotation,
            applied_rotation: rotation.inverse(),
        }
    }

    /// Bytes in one producer framebuffer row.
    #[inline]
    pub fn stride_bytes(&self) -> usize {
        self.fb_width as usize * 3
    }

    /// Bytes in one full frame (identical for producer and panel
    /// orientation; rotation preserves the pixel count).
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.fb_width as usize * self.fb_height as usize * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_rotations() {
        assert_eq!(Rotation::Deg0.inverse(), Rotation::Deg0);
        assert_eq!(Rotation::Deg90.inverse(), Rotation::Deg270);
        assert_eq!(Rotation::Deg180.inverse(), Rotation::Deg180);
        assert_eq!(Rotation::Deg270.inverse(), Rotation::Deg90);
        // (360 - r) % 360 for every r.
        for deg in [0u32, 90, 180, 270] {
            let r = Rotation::from_degrees(deg).unwrap();
            assert_eq!(r.inverse().degrees(), (360 - deg) % 360);
        }
    }

    #[test]
    fn geometry_swaps_axes_for_quarter_turns() {
        let g = Geometry::derive(480, 320, Rotation::Deg90);
        assert_eq!((g.fb_width, g.fb_height), (320, 480));
        assert_eq!(g.applied_rotation, Rotation::Deg270);
        assert_eq!(g.frame_bytes(), 480 * 320 * 3);

        let g = Geometry::derive(480, 320, Rotation::Deg180);
        assert_eq!((g.fb_width, g.fb_height), (480, 320));
        assert_eq!(g.applied_rotation, Rotation::Deg180);

        let g = Geometry::derive(480, 320, Rotation::Deg0);
        assert_eq!((g.fb_width, g.fb_height), (480, 320));
        assert_eq!(g.applied_rotation, Rotation::Deg0);
    }

    #[test]
    fn rejects_invalid_rotation() {
        assert!(Rotation::from_degrees(45).is_none());
        assert!(Rotation::from_degrees(360).is_none());
    }
}
