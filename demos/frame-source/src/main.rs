//! Demo producer: connects to a running ili9488d arena and streams a moving
//! rainbow gradient for a fixed duration. Doubles as a benchmark source.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ili9488_shm::ArenaClient;

#[derive(Debug, Parser)]
#[command(name = "frame-source", about = "Animated frame producer for ili9488d")]
struct Options {
    /// Shared-memory name the daemon was started with.
    #[arg(long, env = "ILI9488_SHM_NAME", default_value = "ili9488_rgb666")]
    shm: String,

    /// How long to stream, in seconds.
    #[arg(long, default_value_t = 15)]
    duration: u64,
}

/// One HSV-rainbow pixel, RGB666-packed (channels topped out at 0xFC).
fn rainbow_pixel(x: u32, y: u32, frame: u32) -> [u8; 3] {
    let hue = ((x + y + frame * 2) % 360) as f32 / 360.0;
    let h6 = hue * 6.0;
    let x_val = 1.0 - (h6 % 2.0 - 1.0).abs();

    let (r, g, b) = match h6 as u32 {
        0 => (1.0, x_val, 0.0),
        1 => (x_val, 1.0, 0.0),
        2 => (0.0, 1.0, x_val),
        3 => (0.0, x_val, 1.0),
        4 => (x_val, 0.0, 1.0),
        _ => (1.0, 0.0, x_val),
    };
    [
        (r * 252.0) as u8,
        (g * 252.0) as u8,
        (b * 252.0) as u8,
    ]
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run() {
        tracing::error!(error = format_args!("{e:#}"), "frame source failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run() -> anyhow::Result<()> {
    let options = Options::parse();

    let client = ArenaClient::open(&options.shm)
        .with_context(|| format!("opening arena {:?}", options.shm))?;
    client.mark_connected();
    if !client.wait_daemon_ready(Duration::from_secs(5)) {
        anyhow::bail!("daemon never became ready");
    }

    tracing::info!(
        shm = %options.shm,
        width = client.width(),
        height = client.height(),
        duration_s = options.duration,
        "streaming frames"
    );

    let deadline = Instant::now() + Duration::from_secs(options.duration);
    let mut frame_num = 0u32;
    let mut sent = 0u64;
    let mut dropped = 0u64;

    while Instant::now() < deadline {
        let wrote = client.try_submit_frame(|buf, width, _| {
            for (i, pixel) in buf.chunks_exact_mut(3).enumerate() {
                let x = i as u32 % width;
                let y = i as u32 / width;
                pixel.copy_from_slice(&rainbow_pixel(x, y, frame_num));
            }
        })?;
        if wrote {
            frame_num = frame_num.wrapping_add(1);
            sent += 1;
        } else {
            // Pending buffer busy; this producer drops the frame.
            dropped += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    tracing::info!(sent, dropped, "frame source done");
    Ok(())
}
