//! # Frame buffers

use bytemuck::{Pod, Zeroable};

/// RGBA colour structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RGBA {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl RGBA {
    pub const RED: Self = Self::opaque(255, 0, 0);
    pub const GREEN: Self = Self::opaque(0, 255, 0);

    /// Create a fully opaque colour.
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Convert from a slice containing `[r, g, b]` elements.
    pub fn from_rgb_slice(rgb: &[u8]) -> Self {
        Self::opaque(rgb[0], rgb[1], rgb[2])
    }

    /// Convert from a slice containing `[b, g, r]` elements.
    pub fn from_bgr_slice(bgr: &[u8]) -> Self {
        Self::opaque(bgr[2], bgr[1], bgr[0])
    }

    /// Integer luminance approximation (BT.601 weights).
    pub fn luma(&self) -> u8 {
        ((self.r as u32 * 299 + self.g as u32 * 587 + self.b as u32 * 114) / 1000) as u8
    }
}

/// Fixed dimension image buffer.
///
/// Pixels are stored in row-major order. Cloning a frame performs a deep copy, which is what the
/// recorder relies on to never alias a buffer the caller reuses on the next iteration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    pixels: Vec<RGBA>,
}

impl Frame {
    /// Create a new frame filled with black pixels.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, RGBA::opaque(0, 0, 0))
    }

    /// Create a new frame filled with a single colour.
    pub fn filled(width: usize, height: usize, colour: RGBA) -> Self {
        Self {
            width,
            height,
            pixels: vec![colour; width * height],
        }
    }

    /// Wrap existing pixels.
    ///
    /// Returns `None` if `pixels.len() != width * height`.
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<RGBA>) -> Option<Self> {
        if pixels.len() == width * height {
            Some(Self {
                width,
                height,
                pixels,
            })
        } else {
            None
        }
    }

    /// Get width and height of the frame.
    pub fn dim(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[RGBA] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [RGBA] {
        &mut self.pixels
    }

    /// Raw RGBA bytes of the frame.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    /// Mutable raw RGBA bytes of the frame.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.pixels)
    }

    /// Resize the frame, discarding its contents.
    ///
    /// The allocation is kept when possible, so sources can reuse one frame for the whole stream.
    pub fn reset(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.resize(width * height, RGBA::default());
    }

    /// Make `self` a copy of `other`, reusing the existing allocation.
    pub fn copy_from(&mut self, other: &Frame) {
        self.width = other.width;
        self.height = other.height;
        self.pixels.clear();
        self.pixels.extend_from_slice(&other.pixels);
    }

    pub fn get(&self, x: usize, y: usize) -> Option<RGBA> {
        if x < self.width && y < self.height {
            Some(self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    pub fn set(&mut self, x: usize, y: usize, colour: RGBA) {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = colour;
        }
    }

    /// Fill a rectangle, clipped to the frame bounds.
    pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, colour: RGBA) {
        let x_end = std::cmp::min(x.saturating_add(w), self.width);
        let y_end = std::cmp::min(y.saturating_add(h), self.height);

        for row in y..y_end {
            for col in x..x_end {
                self.pixels[row * self.width + col] = colour;
            }
        }
    }

    /// Draw a rectangle outline of given thickness, clipped to the frame bounds.
    pub fn draw_rect(
        &mut self,
        (x, y, w, h): (usize, usize, usize, usize),
        thickness: usize,
        colour: RGBA,
    ) {
        if w == 0 || h == 0 {
            return;
        }

        let t = std::cmp::max(thickness, 1);

        self.fill_rect(x, y, w, t, colour);
        self.fill_rect(x, (y + h).saturating_sub(t), w, t, colour);
        self.fill_rect(x, y, t, h, colour);
        self.fill_rect((x + w).saturating_sub(t), y, t, h, colour);
    }
}
