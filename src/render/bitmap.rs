//! Owned RGBA8 bitmaps

use std::path::Path;

use super::error::RenderError;

pub const BYTES_PER_PIXEL: usize = 4;

/// Default ceiling on bitmap size, 64 megapixels (256 MiB of RGBA).
pub const DEFAULT_MAX_PIXELS: u64 = 64 * 1024 * 1024;

/// Straight-alpha RGBA8 bitmap, rows tightly packed.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Allocate a fully transparent bitmap.
    ///
    /// Fails with `OutOfMemory` when the size exceeds `max_pixels` or the
    /// allocator refuses the buffer, instead of aborting the process.
    pub fn allocate(width: u32, height: u32, max_pixels: u64) -> Result<Self, RenderError> {
        let oom = || RenderError::OutOfMemory {
            width: u64::from(width),
            height: u64::from(height),
        };

        let count = u64::from(width)
            .checked_mul(u64::from(height))
            .filter(|count| *count <= max_pixels)
            .ok_or_else(oom)?;
        let len = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(oom)?;

        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|_| oom())?;
        pixels.resize(len, 0);

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Wrap an existing RGBA buffer; `None` if the length does not match.
    #[must_use]
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(BYTES_PER_PIXEL)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// RGBA of one pixel, `None` outside the bitmap.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        let px = self.pixels.get(i..i + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        if let Some(px) = self.pixels.get_mut(i..i + BYTES_PER_PIXEL) {
            px.copy_from_slice(&rgba);
        }
    }

    pub fn save_png(&self, path: &Path) -> image::ImageResult<()> {
        image::save_buffer_with_format(
            path,
            &self.pixels,
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// `round(native * scale)` for both axes, at least one pixel each.
#[must_use]
pub fn scaled_dimensions(native: (f32, f32), scale: f32) -> (u32, u32) {
    let dim = |v: f32| {
        let scaled = (f64::from(v) * f64::from(scale)).round();
        if scaled >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            (scaled as u32).max(1)
        }
    };
    (dim(native.0), dim(native.1))
}
