//! The per-frame orchestration loop.
//!
//! Steady state: poll the pending semaphore, pull any new producer frame
//! from the shared mirror into the DMA-coherent pending buffer, overlay the
//! FPS readout, rotate (or promote directly on the 0-degree path), swap
//! roles, stream the front buffer to the panel, pace. Per-frame failures
//! drop that frame and keep the loop alive; only the shutdown flag ends it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ili9488_shm::TripleBufferArena;

use crate::config::{Geometry, Rotation};
use crate::overlay::FpsOverlay;
use crate::pool::DmaBufferPool;
use crate::rotate::RotateEngine;
use crate::spi::{PanelLink, SpiTransport};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct FrameLoop<L: PanelLink> {
    arena: TripleBufferArena,
    pool: DmaBufferPool,
    rotate: RotateEngine,
    spi: SpiTransport<L>,
    geometry: Geometry,
    overlay: Option<FpsOverlay>,
    max_fps: u32,
    running: &'static AtomicBool,
    last_frame_counter: u32,
    frames_consumed: u64,
}

impl<L: PanelLink> FrameLoop<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arena: TripleBufferArena,
        pool: DmaBufferPool,
        rotate: RotateEngine,
        spi: SpiTransport<L>,
        geometry: Geometry,
        overlay_enabled: bool,
        max_fps: u32,
        running: &'static AtomicBool,
    ) -> Self {
        FrameLoop {
            arena,
            pool,
            rotate,
            spi,
            geometry,
            overlay: overlay_enabled.then(FpsOverlay::new),
            max_fps,
            running,
            last_frame_counter: 0,
            frames_consumed: 0,
        }
    }

    #[inline]
    pub fn arena(&self) -> &TripleBufferArena {
        &self.arena
    }

    #[inline]
    pub fn spi(&self) -> &SpiTransport<L> {
        &self.spi
    }

    /// New producer frames pulled in so far.
    #[inline]
    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed
    }

    /// Run until the shutdown flag clears. The arena is announced ready on
    /// entry; in-flight work finishes before return.
    pub fn run(&mut self) {
        self.arena
            .set_rotation_degrees(self.geometry.producer_rotation.degrees());
        self.arena.set_daemon_ready();

        let frame_time = (self.max_fps > 0)
            .then(|| Duration::from_micros(1_000_000 / u64::from(self.max_fps)));
        let sem = self.arena.pending_sem();
        let mut frame_start = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            match sem.try_wait() {
                Ok(true) => {}
                Ok(false) => {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "pending semaphore wait failed");
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
            }

            let (_, _, pending_idx) = self.arena.role_indices();
            let counter = self.arena.frame_counter();
            if counter != self.last_frame_counter {
                // SAFETY: the semaphore is held, so the producer cannot be
                // writing the mirror, and the copy only touches the pending
                // DMA buffer (invariant: rotation writes back, SPI reads
                // front).
                unsafe {
                    let mirror = self.arena.pending_mirror();
                    self.pool
                        .buffer_mut(pending_idx as usize)
                        .copy_from_slice(mirror);
                }
                self.last_frame_counter = counter;
                self.frames_consumed += 1;
            }

            if let Err(e) = sem.post() {
                tracing::error!(error = %e, "pending semaphore post failed");
            }

            if let Some(overlay) = &mut self.overlay {
                overlay.tick();
                // SAFETY: pending buffer, same disjointness as the copy.
                let pending = unsafe { self.pool.buffer_mut(pending_idx as usize) };
                overlay.draw(pending, self.geometry.fb_width, self.geometry.fb_height);
            }

            // The producer-facing rotation decides the path; the header is
            // re-read so a reconnecting producer with a different idea still
            // gets a coherent (if unrotated) picture.
            let rotation = Rotation::from_degrees(self.arena.rotation_degrees())
                .unwrap_or(self.geometry.producer_rotation);

            if rotation == Rotation::Deg0 {
                // Promote the fresh frame straight to front.
                self.arena.rotate3();
            } else {
                let (_, back_idx, pending_idx) = self.arena.role_indices();
                let bus = self.pool.bus_addrs();
                // SAFETY: pending and back are distinct buffers by the
                // permutation invariant.
                let (src, dst) = unsafe {
                    (
                        self.pool.buffer(pending_idx as usize),
                        self.pool.buffer_mut(back_idx as usize),
                    )
                };
                self.rotate.rotate(
                    src,
                    bus[pending_idx as usize],
                    dst,
                    bus[back_idx as usize],
                    self.geometry.fb_width,
                    self.geometry.fb_height,
                    self.geometry.applied_rotation,
                );
                self.arena.swap_back_front();
            }

            let (front_idx, _, _) = self.arena.role_indices();
            // SAFETY: SPI only reads front; nothing writes it until the next
            // role change.
            let front = unsafe { self.pool.buffer(front_idx as usize) };
            if let Err(e) = self.spi.transmit(front) {
                tracing::warn!(error = %e, "SPI transmit failed, frame dropped");
            }

            if let Some(frame_time) = frame_time {
                let elapsed = frame_start.elapsed();
                if elapsed < frame_time {
                    std::thread::sleep(frame_time - elapsed);
                }
                frame_start = Instant::now();
            }
        }

        tracing::info!(
            frames = self.frames_consumed,
            "frame loop stopped, shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::CaptureLink;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("loop-test-{}-{}-{}", tag, std::process::id(), id)
    }

    fn leaked_flag(initial: bool) -> &'static AtomicBool {
        Box::leak(Box::new(AtomicBool::new(initial)))
    }

    #[test]
    fn stops_immediately_when_flag_clear() {
        let geometry = Geometry::derive(4, 4, Rotation::Deg0);
        let arena =
            TripleBufferArena::create(&unique_name("stop"), 4, 4, [0; 3]).unwrap();
        let pool = DmaBufferPool::allocate_cpu_only(4, 4).unwrap();
        let spi = SpiTransport::new(CaptureLink::default(), 4, 4, 65_536, 1, 1);
        let mut frame_loop = FrameLoop::new(
            arena,
            pool,
            RotateEngine::new(None),
            spi,
            geometry,
            false,
            0,
            leaked_flag(false),
        );
        frame_loop.run();
        assert_eq!(frame_loop.frames_consumed(), 0);
        // Readiness is still announced so producers do not hang forever.
        assert_eq!(
            frame_loop
                .arena()
                .header()
                .daemon_ready
                .load(Ordering::Acquire),
            1
        );
    }
}
