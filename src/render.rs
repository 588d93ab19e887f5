use serde::{Deserialize, Serialize};

// =============================================================================
// Palette
// =============================================================================

pub type Rgb = (u8, u8, u8);

/// NES palette codes 0x00-0x3F plus the dimmed 0x40-0x7F range the emulator
/// script reports for darkened screens.
const PALETTE: [Rgb; 128] = [
    (116, 116, 116), (36, 24, 140), (0, 0, 168), (68, 0, 156),
    (140, 0, 116), (168, 0, 16), (164, 0, 0), (124, 8, 0),
    (64, 44, 0), (0, 68, 0), (0, 80, 0), (0, 60, 20),
    (24, 60, 92), (0, 0, 0), (0, 0, 0), (0, 0, 0),
    (188, 188, 188), (0, 112, 236), (32, 56, 236), (128, 0, 240),
    (188, 0, 188), (228, 0, 88), (216, 40, 0), (200, 76, 12),
    (136, 112, 0), (0, 148, 0), (0, 168, 0), (0, 144, 56),
    (0, 128, 136), (0, 0, 0), (0, 0, 0), (0, 0, 0),
    (252, 252, 252), (60, 188, 252), (92, 148, 252), (204, 136, 252),
    (244, 120, 252), (252, 116, 180), (252, 116, 96), (252, 152, 56),
    (240, 188, 60), (128, 208, 16), (76, 220, 72), (88, 248, 152),
    (0, 232, 216), (120, 120, 120), (0, 0, 0), (0, 0, 0),
    (252, 252, 252), (168, 228, 252), (196, 212, 252), (212, 200, 252),
    (252, 196, 252), (252, 196, 216), (252, 188, 176), (252, 216, 168),
    (252, 228, 160), (224, 252, 160), (168, 240, 188), (176, 252, 204),
    (156, 252, 240), (196, 196, 196), (0, 0, 0), (0, 0, 0),
    (87, 87, 87), (27, 18, 105), (0, 0, 126), (51, 0, 117),
    (105, 0, 87), (126, 0, 12), (123, 0, 0), (93, 6, 0),
    (48, 33, 0), (0, 51, 0), (0, 60, 0), (0, 45, 15),
    (18, 45, 69), (0, 0, 0), (0, 0, 0), (0, 0, 0),
    (141, 141, 141), (0, 84, 177), (24, 42, 177), (96, 0, 180),
    (141, 0, 141), (171, 0, 66), (162, 30, 0), (150, 57, 9),
    (102, 84, 0), (0, 111, 0), (0, 126, 0), (0, 108, 42),
    (0, 96, 102), (0, 0, 0), (0, 0, 0), (0, 0, 0),
    (189, 189, 189), (45, 141, 189), (69, 111, 189), (153, 102, 189),
    (183, 90, 189), (189, 87, 135), (189, 87, 72), (189, 114, 42),
    (180, 141, 45), (96, 156, 12), (57, 165, 54), (66, 186, 114),
    (0, 174, 162), (90, 90, 90), (0, 0, 0), (0, 0, 0),
    (189, 189, 189), (126, 171, 189), (147, 159, 189), (159, 150, 189),
    (189, 147, 189), (189, 147, 162), (189, 141, 132), (189, 162, 126),
    (189, 171, 120), (168, 189, 120), (126, 180, 141), (132, 189, 153),
    (117, 189, 180), (147, 147, 147), (0, 0, 0), (0, 0, 0),
];

/// RGB for a palette code; codes outside the table render black.
pub fn palette_rgb(code: u8) -> Rgb {
    PALETTE.get(code as usize).copied().unwrap_or((0, 0, 0))
}

/// Same as [`palette_rgb`] for a two-digit hex code as sent on the wire.
pub fn palette_rgb_hex(code: &str) -> Rgb {
    u8::from_str_radix(code, 16)
        .map(palette_rgb)
        .unwrap_or((0, 0, 0))
}

// =============================================================================
// Observation
// =============================================================================

pub const SCREEN_WIDTH: usize = 256;
pub const SCREEN_HEIGHT: usize = 224;

/// Row-major RGB frame buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Default for Observation {
    fn default() -> Self {
        Self::blank()
    }
}

impl Observation {
    pub fn blank() -> Self {
        Self {
            width: SCREEN_WIDTH,
            height: SCREEN_HEIGHT,
            pixels: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT * 3],
        }
    }

    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&p| p == 0)
    }

    pub fn pixel(&self, x: usize, y: usize) -> Rgb {
        let i = (y * self.width + x) * 3;
        (self.pixels[i], self.pixels[i + 1], self.pixels[i + 2])
    }

    /// Paints one row from concatenated two-digit hex palette codes. Rows
    /// outside the screen are ignored and extra codes are dropped.
    pub fn apply_row(&mut self, row: usize, codes: &str) {
        if row >= self.height {
            return;
        }
        let start = row * self.width * 3;
        for (x, chunk) in codes.as_bytes().chunks_exact(2).take(self.width).enumerate() {
            let (r, g, b) = std::str::from_utf8(chunk)
                .map(palette_rgb_hex)
                .unwrap_or((0, 0, 0));
            let i = start + x * 3;
            self.pixels[i] = r;
            self.pixels[i + 1] = g;
            self.pixels[i + 2] = b;
        }
    }
}

// =============================================================================
// Rendering
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    /// Show the frame in a window (needs the `viewer` feature).
    Human,
    /// Return a copy of the frame buffer.
    RgbArray,
}

#[cfg(feature = "viewer")]
pub struct Viewer {
    window: minifb::Window,
    buffer: Vec<u32>,
}

#[cfg(feature = "viewer")]
impl Viewer {
    pub fn new(title: &str) -> crate::Result<Self> {
        let window = minifb::Window::new(
            title,
            SCREEN_WIDTH,
            SCREEN_HEIGHT,
            minifb::WindowOptions {
                scale: minifb::Scale::X2,
                ..minifb::WindowOptions::default()
            },
        )
        .map_err(|e| crate::EnvError::Configuration(format!("unable to open viewer: {e}")))?;
        Ok(Self {
            window,
            buffer: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
        })
    }

    pub fn is_open(&self) -> bool {
        self.window.is_open()
    }

    pub fn show(&mut self, obs: &Observation) -> crate::Result<()> {
        for (dst, src) in self.buffer.iter_mut().zip(obs.pixels.chunks_exact(3)) {
            *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
        }
        self.window
            .update_with_buffer(&self.buffer, obs.width, obs.height)
            .map_err(|e| crate::EnvError::Configuration(format!("viewer update failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert_eq!(palette_rgb(0x00), (116, 116, 116));
        assert_eq!(palette_rgb(0x21), (60, 188, 252));
        assert_eq!(palette_rgb_hex("7d"), (147, 147, 147));
    }

    #[test]
    fn unknown_codes_are_black() {
        assert_eq!(palette_rgb(0x80), (0, 0, 0));
        assert_eq!(palette_rgb_hex("zz"), (0, 0, 0));
    }

    #[test]
    fn rows_paint_pixels() {
        let mut obs = Observation::blank();
        assert!(obs.is_blank());
        obs.apply_row(3, "2100");
        assert_eq!(obs.pixel(0, 3), (60, 188, 252));
        assert_eq!(obs.pixel(1, 3), (116, 116, 116));
        assert_eq!(obs.pixel(2, 3), (0, 0, 0));
        obs.apply_row(SCREEN_HEIGHT, "21");
        assert!(!obs.is_blank());
    }
}
