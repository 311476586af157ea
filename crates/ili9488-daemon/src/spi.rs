//! SPI transport: spidev + GPIO plumbing and the ILI9488 command protocol.
//!
//! The byte-level side (one command byte with D/C low, a parameter or pixel
//! burst with D/C high) is the [`PanelLink`] trait; [`SpidevLink`] is the
//! real implementation and [`CaptureLink`] records the stream for tests and
//! bring-up. [`SpiTransport`] owns the panel protocol: the init sequence,
//! per-frame DCS framing and chunked pixel streaming.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::ioc;
use crate::mailbox::{open_cloexec, BusMapping};

// MIPI-DCS commands the data plane uses.
const CMD_INVERSION_OFF: u8 = 0x20;
const CMD_COLUMN_ADDRESS_SET: u8 = 0x2A;
const CMD_PAGE_ADDRESS_SET: u8 = 0x2B;
const CMD_MEMORY_WRITE: u8 = 0x2C;
const CMD_SLEEP_OUT: u8 = 0x11;
const CMD_DISPLAY_ON: u8 = 0x29;
const CMD_IDLE_OFF: u8 = 0x38;
const CMD_NORMAL_DISPLAY: u8 = 0x13;

/// Byte-level panel connection.
///
/// Implementations raise or lower the D/C line as part of each call; the
/// transport above never touches GPIO directly.
pub trait PanelLink {
    /// One command byte, D/C low.
    fn send_command(&mut self, command: u8) -> io::Result<()>;
    /// A parameter or pixel burst, D/C high. One call is one bus transfer.
    fn send_data(&mut self, data: &[u8]) -> io::Result<()>;
    /// Switch the bus clock (init runs slower than streaming).
    fn set_speed(&mut self, speed_hz: u32);
    /// Hardware reset pulse: RESET low 120 ms, high 120 ms.
    fn reset_pulse(&mut self) -> io::Result<()>;
}

/// SPI bus and GPIO configuration for [`SpidevLink`].
#[derive(Debug, Clone)]
pub struct SpiConfig {
    pub device: String,
    pub speed_hz: u32,
    pub mode: u8,
    pub bits_per_word: u8,
    pub dc_gpio: u32,
    pub reset_gpio: u32,
}

// spidev ioctls ('k').
const SPI_IOC_WR_MODE: libc::c_ulong = ioc::iow(b'k' as u32, 1, 1);
const SPI_IOC_WR_BITS_PER_WORD: libc::c_ulong = ioc::iow(b'k' as u32, 3, 1);
const SPI_IOC_WR_MAX_SPEED_HZ: libc::c_ulong = ioc::iow(b'k' as u32, 4, 4);

/// `struct spi_ioc_transfer`.
#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

/// `SPI_IOC_MESSAGE(1)`.
const SPI_IOC_MESSAGE_1: libc::c_ulong =
    ioc::iow(b'k' as u32, 0, std::mem::size_of::<SpiIocTransfer>());

// GPIO character-device ioctls (0xB4).
const GPIO_LINES_MAX: usize = 64;
const GPIO_LABEL_LEN: usize = 32;

#[repr(C)]
struct GpioHandleRequest {
    lineoffsets: [u32; GPIO_LINES_MAX],
    flags: u32,
    default_values: [u8; GPIO_LINES_MAX],
    consumer_label: [u8; GPIO_LABEL_LEN],
    lines: u32,
    fd: i32,
}

#[repr(C)]
struct GpioHandleData {
    values: [u8; GPIO_LINES_MAX],
}

const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
const GPIO_GET_LINEHANDLE_IOCTL: libc::c_ulong =
    ioc::iowr(0xB4, 0x03, std::mem::size_of::<GpioHandleRequest>());
const GPIOHANDLE_SET_LINE_VALUES_IOCTL: libc::c_ulong =
    ioc::iowr(0xB4, 0x09, std::mem::size_of::<GpioHandleData>());

/// The real panel connection: spidev transfers plus D/C and RESET lines on
/// `gpiochip0`.
pub struct SpidevLink {
    spi: OwnedFd,
    _chip: OwnedFd,
    dc_line: OwnedFd,
    reset_line: OwnedFd,
    current_speed_hz: u32,
    bits_per_word: u8,
}

impl SpidevLink {
    pub fn open(config: &SpiConfig) -> io::Result<Self> {
        let device = std::ffi::CString::new(config.device.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid spidev path"))?;
        let spi = open_cloexec(&device, libc::O_RDWR)?;

        let mode = config.mode;
        let bits = config.bits_per_word;
        let speed = config.speed_hz;
        unsafe {
            if libc::ioctl(spi.as_raw_fd(), SPI_IOC_WR_MODE, &mode) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(spi.as_raw_fd(), SPI_IOC_WR_BITS_PER_WORD, &bits) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(spi.as_raw_fd(), SPI_IOC_WR_MAX_SPEED_HZ, &speed) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let chip = open_cloexec(c"/dev/gpiochip0", libc::O_RDWR)?;
        let dc_line = request_output_line(&chip, config.dc_gpio, true)?;
        let reset_line = request_output_line(&chip, config.reset_gpio, true)?;

        tracing::info!(
            device = %config.device,
            speed_hz = config.speed_hz,
            dc_gpio = config.dc_gpio,
            reset_gpio = config.reset_gpio,
            "opened SPI panel link"
        );
        Ok(SpidevLink {
            spi,
            _chip: chip,
            dc_line,
            reset_line,
            current_speed_hz: config.speed_hz,
            bits_per_word: config.bits_per_word,
        })
    }

    fn transfer(&self, data: &[u8]) -> io::Result<()> {
        let transfer = SpiIocTransfer {
            tx_buf: data.as_ptr() as u64,
            len: data.len() as u32,
            speed_hz: self.current_speed_hz,
            bits_per_word: self.bits_per_word,
            ..Default::default()
        };
        let rc = unsafe { libc::ioctl(self.spi.as_raw_fd(), SPI_IOC_MESSAGE_1, &transfer) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_dc(&self, high: bool) -> io::Result<()> {
        set_line_value(&self.dc_line, high)
    }
}

impl PanelLink for SpidevLink {
    fn send_command(&mut self, command: u8) -> io::Result<()> {
        self.set_dc(false)?;
        self.transfer(&[command])
    }

    fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.set_dc(true)?;
        self.transfer(data)
    }

    fn set_speed(&mut self, speed_hz: u32) {
        self.current_speed_hz = speed_hz;
    }

    fn reset_pulse(&mut self) -> io::Result<()> {
        set_line_value(&self.reset_line, false)?;
        std::thread::sleep(Duration::from_millis(120));
        set_line_value(&self.reset_line, true)?;
        std::thread::sleep(Duration::from_millis(120));
        Ok(())
    }
}

fn request_output_line(chip: &OwnedFd, gpio: u32, initial: bool) -> io::Result<OwnedFd> {
    // SAFETY: zeroed GpioHandleRequest is a valid all-defaults request.
    let mut request: GpioHandleRequest = unsafe { std::mem::zeroed() };
    request.lineoffsets[0] = gpio;
    request.flags = GPIOHANDLE_REQUEST_OUTPUT;
    request.default_values[0] = initial as u8;
    request.lines = 1;
    let label = b"ili9488d";
    request.consumer_label[..label.len()].copy_from_slice(label);

    let rc = unsafe { libc::ioctl(chip.as_raw_fd(), GPIO_GET_LINEHANDLE_IOCTL, &mut request) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(request.fd) })
}

fn set_line_value(line: &OwnedFd, high: bool) -> io::Result<()> {
    let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
    data.values[0] = high as u8;
    let rc = unsafe { libc::ioctl(line.as_raw_fd(), GPIOHANDLE_SET_LINE_VALUES_IOCTL, &mut data) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A recording link: every command, burst, reset and speed change is kept
/// in order. Used by the protocol tests and handy for dry-running the init
/// sequence on a machine without the panel.
#[derive(Default)]
pub struct CaptureLink {
    pub events: Vec<LinkEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Command(u8),
    Data(Vec<u8>),
    Reset,
    Speed(u32),
}

impl PanelLink for CaptureLink {
    fn send_command(&mut self, command: u8) -> io::Result<()> {
        self.events.push(LinkEvent::Command(command));
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.events.push(LinkEvent::Data(data.to_vec()));
        Ok(())
    }

    fn set_speed(&mut self, speed_hz: u32) {
        self.events.push(LinkEvent::Speed(speed_hz));
    }

    fn reset_pulse(&mut self) -> io::Result<()> {
        self.events.push(LinkEvent::Reset);
        Ok(())
    }
}

/// One step of the power-on sequence.
enum InitStep {
    Cmd(u8),
    CmdData(u8, &'static [u8]),
    DelayMs(u64),
}

/// ILI9488 power-on sequence (RGB666 over SPI, BGR + MX scan order).
const INIT_SEQUENCE: &[InitStep] = &[
    // Positive / negative gamma.
    InitStep::CmdData(
        0xE0,
        &[
            0x00, 0x03, 0x09, 0x08, 0x16, 0x0A, 0x3F, 0x78, 0x4C, 0x09, 0x0A, 0x08, 0x16, 0x1A,
            0x0F,
        ],
    ),
    InitStep::CmdData(
        0xE1,
        &[
            0x00, 0x16, 0x19, 0x03, 0x0F, 0x05, 0x32, 0x45, 0x46, 0x04, 0x0E, 0x0D, 0x35, 0x37,
            0x0F,
        ],
    ),
    // Power control 1 and 2.
    InitStep::CmdData(0xC0, &[0x17, 0x15]),
    InitStep::CmdData(0xC1, &[0x41]),
    // VCOM.
    InitStep::CmdData(0xC5, &[0x00, 0x12, 0x80]),
    // MADCTL: BGR + MX.
    InitStep::CmdData(0x36, &[0x48]),
    // Pixel format RGB666.
    InitStep::CmdData(0x3A, &[0x66]),
    // Interface mode.
    InitStep::CmdData(0xB0, &[0x80]),
    // Frame rate.
    InitStep::CmdData(0xB1, &[0xA0]),
    // Display inversion control, inversion off.
    InitStep::CmdData(0xB4, &[0x02]),
    InitStep::Cmd(CMD_INVERSION_OFF),
    // Display function.
    InitStep::CmdData(0xB6, &[0x02, 0x02]),
    // Image function.
    InitStep::CmdData(0xE9, &[0x00]),
    // Adjust control.
    InitStep::CmdData(0xF7, &[0xA9, 0x51, 0x2C, 0x82]),
    InitStep::Cmd(CMD_SLEEP_OUT),
    InitStep::DelayMs(120),
    InitStep::Cmd(CMD_DISPLAY_ON),
    InitStep::Cmd(CMD_IDLE_OFF),
    InitStep::Cmd(CMD_NORMAL_DISPLAY),
];

/// Panel-level transport: owns a link and speaks the ILI9488 protocol.
pub struct SpiTransport<L: PanelLink> {
    link: L,
    width: u32,
    height: u32,
    chunk_bytes: usize,
    speed_hz: u32,
    init_speed_hz: u32,
    mem: Option<OwnedFd>,
}

impl<L: PanelLink> SpiTransport<L> {
    pub fn new(
        link: L,
        width: u32,
        height: u32,
        chunk_bytes: usize,
        speed_hz: u32,
        init_speed_hz: u32,
    ) -> Self {
        SpiTransport {
            link,
            width,
            height,
            chunk_bytes,
            speed_hz,
            init_speed_hz,
            mem: None,
        }
    }

    #[inline]
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Reset the panel and run the power-on sequence at the init clock,
    /// then revert to the streaming clock.
    pub fn init_panel(&mut self) -> io::Result<()> {
        let init_speed = if self.init_speed_hz > 0 {
            self.init_speed_hz.min(self.speed_hz)
        } else {
            self.speed_hz
        };
        self.link.set_speed(init_speed);
        self.link.reset_pulse()?;

        for step in INIT_SEQUENCE {
            match step {
                InitStep::Cmd(cmd) => self.link.send_command(*cmd)?,
                InitStep::CmdData(cmd, data) => {
                    self.link.send_command(*cmd)?;
                    self.link.send_data(data)?;
                }
                InitStep::DelayMs(ms) => std::thread::sleep(Duration::from_millis(*ms)),
            }
        }

        self.link.set_speed(self.speed_hz);
        tracing::info!(width = self.width, height = self.height, "panel initialized");
        Ok(())
    }

    /// Stream one full frame: column/page window, memory write, then the
    /// pixel bytes in chunks of at most `chunk_bytes`.
    pub fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let expected = self.width as usize * self.height as usize * 3;
        if frame.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame is {} bytes, panel needs {expected}", frame.len()),
            ));
        }

        let col_end = (self.width - 1) as u16;
        self.link.send_command(CMD_COLUMN_ADDRESS_SET)?;
        self.link
            .send_data(&[0x00, 0x00, (col_end >> 8) as u8, (col_end & 0xFF) as u8])?;

        let page_end = (self.height - 1) as u16;
        self.link.send_command(CMD_PAGE_ADDRESS_SET)?;
        self.link
            .send_data(&[0x00, 0x00, (page_end >> 8) as u8, (page_end & 0xFF) as u8])?;

        self.link.send_command(CMD_MEMORY_WRITE)?;
        for chunk in frame.chunks(self.chunk_bytes) {
            self.link.send_data(chunk)?;
        }
        Ok(())
    }

    /// Stream a frame straight from a bus address, mapping the physical
    /// region read-only through `/dev/mem`.
    ///
    /// The spidev path still copies into the kernel, so this is an
    /// opportunistic fallback, not zero-copy.
    pub fn transmit_bus_addr(&mut self, bus_addr: u32, len: usize) -> io::Result<()> {
        if self.mem.is_none() {
            self.mem = Some(open_cloexec(
                c"/dev/mem",
                libc::O_RDONLY | libc::O_SYNC,
            )?);
        }
        let mapping = BusMapping::map(
            self.mem.as_ref().unwrap(),
            bus_addr,
            len,
            libc::PROT_READ,
        )?;
        // SAFETY: the mapping covers len bytes starting at data_ptr.
        let frame = unsafe { std::slice::from_raw_parts(mapping.data_ptr(), len) };
        self.transmit(frame)
    }

    /// True direct DMA into the SPI FIFO is reserved, not implemented.
    #[inline]
    pub fn supports_bus_addr_transfer(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_transport(width: u32, height: u32, chunk: usize) -> SpiTransport<CaptureLink> {
        SpiTransport::new(CaptureLink::default(), width, height, chunk, 65_000_000, 4_000_000)
    }

    #[test]
    fn frame_framing_for_2x2() {
        let mut spi = capture_transport(2, 2, 65_536);
        let frame: Vec<u8> = (0..12).collect();
        spi.transmit(&frame).unwrap();

        let events = &spi.link().events;
        assert_eq!(
            events[0..2],
            [
                LinkEvent::Command(0x2A),
                LinkEvent::Data(vec![0x00, 0x00, 0x00, 0x01]),
            ]
        );
        assert_eq!(
            events[2..4],
            [
                LinkEvent::Command(0x2B),
                LinkEvent::Data(vec![0x00, 0x00, 0x00, 0x01]),
            ]
        );
        assert_eq!(events[4], LinkEvent::Command(0x2C));
        assert_eq!(events[5], LinkEvent::Data(frame.clone()));
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn pixel_bytes_per_frame_are_exact() {
        // Chunking must neither drop nor duplicate bytes.
        let (w, h) = (31u32, 7u32);
        let mut spi = capture_transport(w, h, 100);
        let frame: Vec<u8> = (0..w * h * 3).map(|i| (i % 255) as u8).collect();
        spi.transmit(&frame).unwrap();

        let streamed: Vec<u8> = spi
            .link()
            .events
            .iter()
            .skip_while(|e| **e != LinkEvent::Command(0x2C))
            .skip(1)
            .flat_map(|e| match e {
                LinkEvent::Data(bytes) => bytes.clone(),
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(streamed, frame);

        // Every burst respects the chunk limit.
        for e in spi
            .link()
            .events
            .iter()
            .skip_while(|e| **e != LinkEvent::Command(0x2C))
        {
            if let LinkEvent::Data(bytes) = e {
                assert!(bytes.len() <= 100);
            }
        }
    }

    #[test]
    fn rejects_wrong_frame_size() {
        let mut spi = capture_transport(2, 2, 65_536);
        assert!(spi.transmit(&[0u8; 11]).is_err());
        assert!(spi.link().events.is_empty());
    }

    #[test]
    fn init_sequence_shape() {
        let mut spi = capture_transport(320, 240, 65_536);
        spi.init_panel().unwrap();
        let events = &spi.link().events;

        // Slow clock, reset pulse, then the command stream.
        assert_eq!(events[0], LinkEvent::Speed(4_000_000));
        assert_eq!(events[1], LinkEvent::Reset);

        // First command pair: positive gamma with 15 parameters.
        assert_eq!(events[2], LinkEvent::Command(0xE0));
        match &events[3] {
            LinkEvent::Data(bytes) => assert_eq!(bytes.len(), 15),
            other => panic!("expected gamma data, got {other:?}"),
        }

        // Pixel format must be RGB666.
        let pixel_format = events
            .iter()
            .position(|e| *e == LinkEvent::Command(0x3A))
            .expect("pixel format command present");
        assert_eq!(events[pixel_format + 1], LinkEvent::Data(vec![0x66]));

        // Ends back at the streaming clock after display-on.
        assert_eq!(*events.last().unwrap(), LinkEvent::Speed(65_000_000));
        assert!(events.contains(&LinkEvent::Command(0x29)));
        assert!(events.contains(&LinkEvent::Command(0x11)));
    }

    #[test]
    fn bus_addr_transfer_is_declared_unsupported() {
        let spi = capture_transport(2, 2, 65_536);
        assert!(!spi.supports_bus_addr_transfer());
    }
}
