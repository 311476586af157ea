//! Shared-memory triple-buffer protocol for the ili9488 display daemon.
//!
//! The daemon creates a named POSIX shared-memory region holding an
//! [`ArenaHeader`] followed by three packed framebuffers. Producers map the
//! same region, acquire the pending-buffer semaphore, write pixels, bump the
//! frame counter and release. The daemon side is [`TripleBufferArena`]; the
//! producer side is [`ArenaClient`].
//!
//! Nothing in this crate touches display hardware; it builds and runs on any
//! Linux machine, which is also how the protocol tests exercise it.

pub mod arena;
pub mod layout;
pub mod region;
pub mod sem;

pub use arena::{ArenaClient, ArenaError, TripleBufferArena};
pub use layout::{ArenaHeader, LayoutError, ARENA_MAGIC, ARENA_VERSION, BYTES_PER_PIXEL};
pub use region::SharedMemory;
pub use sem::SharedSemaphore;
