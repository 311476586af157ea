//! ili9488d: stream a shared-memory framebuffer to an ILI9488 SPI panel.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ili9488_daemon::config::Options;
use ili9488_daemon::frame_loop::FrameLoop;
use ili9488_daemon::peripheral::PeripheralMap;
use ili9488_daemon::pool::DmaBufferPool;
use ili9488_daemon::rotate::{RotateEngine, ROTATE_DMA_CHANNEL};
use ili9488_daemon::spi::{SpiConfig, SpiTransport, SpidevLink};
use ili9488_shm::TripleBufferArena;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Usage errors exit 1, not clap's default 2; --help and --version stay 0.
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(e) => {
            let informational = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            return if informational {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    if let Err(e) = run(options) {
        tracing::error!(error = format_args!("{e:#}"), "daemon failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(options: Options) -> anyhow::Result<()> {
    options.validate().map_err(anyhow::Error::msg)?;
    let geometry = options.geometry();

    install_signal_handlers();

    let pool = DmaBufferPool::allocate(geometry.fb_width, geometry.fb_height)
        .context("allocating frame buffers")?;

    let arena = TripleBufferArena::create(
        &options.shm,
        geometry.fb_width,
        geometry.fb_height,
        pool.bus_addrs(),
    )
    .context("creating triple-buffer shared memory")?;

    // Hardware rotation is only worth probing when the buffers are
    // bus-addressable.
    let rotate = if pool.can_dma_rotate() {
        RotateEngine::new(PeripheralMap::probe(ROTATE_DMA_CHANNEL).map(|map| map.dma))
    } else {
        RotateEngine::new(None)
    };

    let link = SpidevLink::open(&SpiConfig {
        device: options.spi_device.clone(),
        speed_hz: options.spi_hz,
        mode: 0,
        bits_per_word: 8,
        dc_gpio: options.dc_gpio,
        reset_gpio: options.reset_gpio,
    })
    .context("opening SPI panel link")?;

    let mut spi = SpiTransport::new(
        link,
        geometry.panel_width,
        geometry.panel_height,
        options.chunk_bytes,
        options.spi_hz,
        options.spi_init_hz,
    );
    spi.init_panel().context("initializing panel")?;

    tracing::info!(
        display = format_args!("{}x{}", geometry.panel_width, geometry.panel_height),
        rotation = options.rotation,
        max_fps = options.max_fps,
        fps_overlay = options.fps_overlay == 1,
        buffers = pool.strategy().as_str(),
        hw_rotate = rotate.hw_available(),
        shm = %options.shm,
        "ili9488d starting"
    );

    let mut frame_loop = FrameLoop::new(
        arena,
        pool,
        rotate,
        spi,
        geometry,
        options.fps_overlay == 1,
        options.max_fps,
        &RUNNING,
    );
    frame_loop.run();

    Ok(())
}
