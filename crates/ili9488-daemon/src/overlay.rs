//! FPS overlay: a tiny 8x8 glyph set rasterized into the pending buffer.

use std::time::Instant;

const FONT_WIDTH: u32 = 8;
const FONT_HEIGHT: u32 = 8;

/// Overlay text position.
const TEXT_X: u32 = 8;
const TEXT_Y: u32 = 8;

/// Overlay color: full-white in RGB666 packing (low 2 bits clear).
const TEXT_COLOR: [u8; 3] = [0xFC, 0xFC, 0xFC];

struct Glyph {
    ch: char,
    rows: [u8; 8],
}

const FONT: &[Glyph] = &[
    Glyph { ch: ' ', rows: [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00] },
    Glyph { ch: ':', rows: [0x00, 0x18, 0x18, 0x00, 0x00, 0x18, 0x18, 0x00] },
    Glyph { ch: '.', rows: [0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00] },
    Glyph { ch: 'F', rows: [0x7E, 0x60, 0x60, 0x7C, 0x60, 0x60, 0x60, 0x00] },
    Glyph { ch: 'P', rows: [0x7C, 0x66, 0x66, 0x7C, 0x60, 0x60, 0x60, 0x00] },
    Glyph { ch: 'S', rows: [0x3C, 0x66, 0x60, 0x3C, 0x06, 0x66, 0x3C, 0x00] },
    Glyph { ch: '0', rows: [0x3C, 0x66, 0x6E, 0x76, 0x66, 0x66, 0x3C, 0x00] },
    Glyph { ch: '1', rows: [0x18, 0x38, 0x18, 0x18, 0x18, 0x18, 0x3C, 0x00] },
    Glyph { ch: '2', rows: [0x3C, 0x66, 0x06, 0x1C, 0x30, 0x60, 0x7E, 0x00] },
    Glyph { ch: '3', rows: [0x3C, 0x66, 0x06, 0x1C, 0x06, 0x66, 0x3C, 0x00] },
    Glyph { ch: '4', rows: [0x0C, 0x1C, 0x3C, 0x6C, 0x7E, 0x0C, 0x0C, 0x00] },
    Glyph { ch: '5', rows: [0x7E, 0x60, 0x7C, 0x06, 0x06, 0x66, 0x3C, 0x00] },
    Glyph { ch: '6', rows: [0x1C, 0x30, 0x60, 0x7C, 0x66, 0x66, 0x3C, 0x00] },
    Glyph { ch: '7', rows: [0x7E, 0x66, 0x0C, 0x18, 0x18, 0x18, 0x18, 0x00] },
    Glyph { ch: '8', rows: [0x3C, 0x66, 0x66, 0x3C, 0x66, 0x66, 0x3C, 0x00] },
    Glyph { ch: '9', rows: [0x3C, 0x66, 0x66, 0x3E, 0x06, 0x0C, 0x38, 0x00] },
];

fn glyph_for(ch: char) -> &'static Glyph {
    FONT.iter().find(|g| g.ch == ch).unwrap_or(&FONT[0])
}

fn draw_char(
    buffer: &mut [u8],
    width: u32,
    height: u32,
    stride_bytes: usize,
    x: u32,
    y: u32,
    ch: char,
) {
    let glyph = glyph_for(ch);
    for (row, bits) in glyph.rows.iter().enumerate() {
        let py = y + row as u32;
        if py >= height {
            continue;
        }
        let row_base = py as usize * stride_bytes;
        for col in 0..FONT_WIDTH {
            let px = x + col;
            if px >= width {
                continue;
            }
            if bits & (0x80 >> col) != 0 {
                let off = row_base + px as usize * 3;
                buffer[off..off + 3].copy_from_slice(&TEXT_COLOR);
            }
        }
    }
}

fn draw_text(buffer: &mut [u8], width: u32, height: u32, stride_bytes: usize, text: &str) {
    let mut cursor_x = TEXT_X;
    for ch in text.chars() {
        draw_char(buffer, width, height, stride_bytes, cursor_x, TEXT_Y, ch);
        cursor_x += FONT_WIDTH;
        if cursor_x >= width {
            break;
        }
    }
}

/// Rolling one-second FPS window plus the rasterizer.
pub struct FpsOverlay {
    window_start: Instant,
    frames: u32,
    fps: f64,
}

impl Default for FpsOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsOverlay {
    pub fn new() -> Self {
        FpsOverlay {
            window_start: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }

    /// Account one frame, refreshing the readout once per second.
    pub fn tick(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed.as_millis() >= 1000 {
            self.fps = self.frames as f64 * 1000.0 / elapsed.as_millis() as f64;
            self.frames = 0;
            self.window_start = Instant::now();
            tracing::debug!(fps = format_args!("{:.1}", self.fps), "frame rate");
        }
    }

    #[inline]
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Clear the text box and draw the current readout into `buffer`.
    pub fn draw(&self, buffer: &mut [u8], width: u32, height: u32) {
        let stride_bytes = width as usize * 3;
        let text = format!("FPS:{:5.1}", self.fps);

        let clear_w = text.len() as u32 * FONT_WIDTH;
        for row in TEXT_Y..(TEXT_Y + FONT_HEIGHT).min(height) {
            let start = row as usize * stride_bytes + TEXT_X as usize * 3;
            let end = (start + clear_w as usize * 3).min(buffer.len());
            if start < end {
                buffer[start..end].fill(0x00);
            }
        }

        draw_text(buffer, width, height, stride_bytes, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_inside_bounds() {
        let (w, h) = (64u32, 24u32);
        let mut buffer = vec![0x55u8; (w * h * 3) as usize];
        let overlay = FpsOverlay::new();
        overlay.draw(&mut buffer, w, h);

        // Some pixels became text color, some were cleared to black.
        assert!(buffer.chunks(3).any(|p| p == TEXT_COLOR));
        assert!(buffer.chunks(3).any(|p| p == [0, 0, 0]));
        // Rows above the text box are untouched.
        let first_rows = &buffer[..(TEXT_Y as usize * w as usize * 3)];
        assert!(first_rows.iter().all(|&b| b == 0x55));
    }

    #[test]
    fn tiny_buffer_does_not_panic() {
        // Narrower than the text; clipping must hold.
        let (w, h) = (10u32, 10u32);
        let mut buffer = vec![0u8; (w * h * 3) as usize];
        let overlay = FpsOverlay::new();
        overlay.draw(&mut buffer, w, h);
    }

    #[test]
    fn unknown_glyph_falls_back_to_space() {
        let glyph = glyph_for('x');
        assert!(glyph.rows.iter().all(|&r| r == 0));
    }
}
