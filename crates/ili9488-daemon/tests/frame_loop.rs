// End-to-end daemon-loop tests against a capturing panel link and plain CPU
// buffers: a producer thread drives the shared arena exactly the way an
// out-of-process client would.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ili9488_daemon::config::{Geometry, Rotation};
use ili9488_daemon::frame_loop::FrameLoop;
use ili9488_daemon::pool::DmaBufferPool;
use ili9488_daemon::rotate::RotateEngine;
use ili9488_daemon::spi::{CaptureLink, LinkEvent, SpiTransport};
use ili9488_shm::{ArenaClient, TripleBufferArena};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("daemon-test-{}-{}-{}", tag, std::process::id(), id)
}

fn leaked_flag() -> &'static AtomicBool {
    Box::leak(Box::new(AtomicBool::new(true)))
}

fn build_loop(
    name: &str,
    panel_w: u32,
    panel_h: u32,
    rotation: Rotation,
    running: &'static AtomicBool,
) -> FrameLoop<CaptureLink> {
    let geometry = Geometry::derive(panel_w, panel_h, rotation);
    let pool = DmaBufferPool::allocate_cpu_only(geometry.fb_width, geometry.fb_height).unwrap();
    let arena = TripleBufferArena::create(
        name,
        geometry.fb_width,
        geometry.fb_height,
        pool.bus_addrs(),
    )
    .unwrap();
    let spi = SpiTransport::new(
        CaptureLink::default(),
        panel_w,
        panel_h,
        65_536,
        65_000_000,
        4_000_000,
    );
    FrameLoop::new(
        arena,
        pool,
        RotateEngine::new(None),
        spi,
        geometry,
        false,
        200,
        running,
    )
}

/// Pixel bursts of every transmitted frame, in order.
fn transmitted_frames(events: &[LinkEvent]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    for event in events {
        match event {
            LinkEvent::Command(0x2C) => current = Some(Vec::new()),
            LinkEvent::Command(0x2A) => {
                if let Some(frame) = current.take() {
                    frames.push(frame);
                }
            }
            LinkEvent::Data(bytes) => {
                if let Some(frame) = &mut current {
                    frame.extend_from_slice(bytes);
                }
            }
            _ => {}
        }
    }
    if let Some(frame) = current.take() {
        frames.push(frame);
    }
    frames
}

#[test]
fn producer_daemon_rendezvous_100_frames() {
    let name = unique_name("rendezvous");
    let running = leaked_flag();
    let mut frame_loop = build_loop(&name, 16, 16, Rotation::Deg0, running);

    let daemon = std::thread::spawn(move || {
        frame_loop.run();
        frame_loop
    });

    let producer_name = name.clone();
    let producer = std::thread::spawn(move || {
        let client = ArenaClient::open(&producer_name).unwrap();
        assert!(client.wait_daemon_ready(Duration::from_secs(1)));
        client.mark_connected();

        let start = Instant::now();
        let mut sent = 0u32;
        while sent < 100 {
            assert!(
                start.elapsed() < Duration::from_secs(1),
                "producer deadlocked"
            );
            let wrote = client
                .try_submit_frame(|buf, _, _| buf.fill((sent % 256) as u8))
                .unwrap();
            if wrote {
                sent += 1;
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    });

    producer.join().unwrap();
    // Let the daemon drain the last frame, then stop it.
    std::thread::sleep(Duration::from_millis(20));
    running.store(false, Ordering::SeqCst);
    let frame_loop = daemon.join().unwrap();

    assert_eq!(frame_loop.arena().frame_counter(), 100);
    assert!(frame_loop.frames_consumed() >= 1);
    assert!(frame_loop.frames_consumed() <= 100);

    // Every transmitted frame is exactly W*H*3 bytes.
    let frames = transmitted_frames(&frame_loop.spi().link().events);
    assert!(!frames.is_empty());
    for frame in &frames {
        assert_eq!(frame.len(), 16 * 16 * 3);
    }

    // The arena permutation survived the run.
    let (f, b, p) = frame_loop.arena().role_indices();
    let mut seen = [false; 3];
    for idx in [f, b, p] {
        seen[idx as usize] = true;
    }
    assert_eq!(seen, [true; 3]);
}

#[test]
fn rotated_path_lands_panel_oriented_pixels() {
    // Panel 4x2, producer rotation 90 => producer renders 2x4 and the
    // daemon applies 270 to land on panel orientation.
    let name = unique_name("rot90");
    let running = leaked_flag();
    let mut frame_loop = build_loop(&name, 4, 2, Rotation::Deg90, running);

    let daemon = std::thread::spawn(move || {
        frame_loop.run();
        frame_loop
    });

    let producer_name = name.clone();
    let pattern: Vec<u8> = (1..=24).collect();
    let producer_pattern = pattern.clone();
    let producer = std::thread::spawn(move || {
        let client = ArenaClient::open(&producer_name).unwrap();
        assert!(client.wait_daemon_ready(Duration::from_secs(1)));
        assert_eq!((client.width(), client.height()), (2, 4));
        client.mark_connected();

        let start = Instant::now();
        loop {
            assert!(start.elapsed() < Duration::from_secs(1));
            let wrote = client
                .try_submit_frame(|buf, _, _| buf.copy_from_slice(&producer_pattern))
                .unwrap();
            if wrote {
                break;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    });

    producer.join().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    running.store(false, Ordering::SeqCst);
    let frame_loop = daemon.join().unwrap();

    assert!(frame_loop.frames_consumed() >= 1);

    // Reference: rotating the producer frame by 270 degrees.
    let mut expected = vec![0u8; 24];
    ili9488_daemon::rotate::rotate_cpu(&pattern, &mut expected, 2, 4, Rotation::Deg270);

    let frames = transmitted_frames(&frame_loop.spi().link().events);
    let last = frames.last().expect("at least one transmitted frame");
    assert_eq!(last, &expected);
}

#[test]
fn daemon_keeps_running_without_producer() {
    let name = unique_name("idle");
    let running = leaked_flag();
    let mut frame_loop = build_loop(&name, 8, 8, Rotation::Deg0, running);

    let daemon = std::thread::spawn(move || {
        frame_loop.run();
        frame_loop
    });

    std::thread::sleep(Duration::from_millis(50));
    running.store(false, Ordering::SeqCst);
    let frame_loop = daemon.join().unwrap();

    assert_eq!(frame_loop.frames_consumed(), 0);
    // No producer, but the stale (zeroed) frame still reaches the panel.
    let frames = transmitted_frames(&frame_loop.spi().link().events);
    assert!(frames.iter().all(|f| f.len() == 8 * 8 * 3));
}
