//! User-space display driver daemon for ILI9488-class SPI TFT panels on
//! BCM283x/BCM2711 boards.
//!
//! The per-frame data plane: a producer writes into the pending slot of a
//! shared triple-buffer arena, the daemon copies it into a DMA-coherent
//! buffer, rotates it (2D DMA when the hardware cooperates, tiled CPU copy
//! otherwise), swaps roles and streams the front buffer to the panel over
//! spidev. Producers and the panel never wait on each other; either side may
//! drop a frame.

pub mod config;
pub mod convert;
pub mod frame_loop;
pub mod ioc;
pub mod mailbox;
pub mod overlay;
pub mod peripheral;
pub mod pool;
pub mod rotate;
pub mod spi;

pub use config::{Geometry, Options, Rotation};
pub use frame_loop::FrameLoop;
pub use pool::{DmaBufferPool, PoolStrategy};
pub use rotate::RotateEngine;
pub use spi::{PanelLink, SpiTransport, SpidevLink};
