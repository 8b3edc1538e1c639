//! Dark-mode colour inversion

use rayon::prelude::*;

use super::bitmap::{BYTES_PER_PIXEL, Bitmap};

/// Bitmaps at least this large are inverted row-parallel.
const PARALLEL_THRESHOLD_PX: usize = 200_000;

/// Invert r,g,b of every pixel whose alpha is non-zero; alpha is kept.
///
/// Fully transparent pixels are left as they are, so applying this twice
/// restores the original bitmap.
pub fn invert_colors(bitmap: &mut Bitmap) {
    let pixel_count = bitmap.width() as usize * bitmap.height() as usize;
    let row_bytes = bitmap.row_bytes();
    if row_bytes == 0 {
        return;
    }

    if pixel_count >= PARALLEL_THRESHOLD_PX {
        bitmap
            .pixels_mut()
            .par_chunks_mut(row_bytes)
            .for_each(invert_row);
    } else {
        invert_row(bitmap.pixels_mut());
    }
}

fn invert_row(row: &mut [u8]) {
    for px in row.chunks_exact_mut(BYTES_PER_PIXEL) {
        if px[3] != 0 {
            px[0] = 255 - px[0];
            px[1] = 255 - px[1];
            px[2] = 255 - px[2];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::bitmap::DEFAULT_MAX_PIXELS;
    use super::*;

    #[test]
    fn inverts_visible_pixels_only() {
        let mut bitmap = Bitmap::from_rgba(
            3,
            1,
            vec![10, 20, 30, 255, 0, 128, 255, 1, 40, 50, 60, 0],
        )
        .unwrap();

        invert_colors(&mut bitmap);

        assert_eq!(bitmap.pixel(0, 0), Some([245, 235, 225, 255]));
        assert_eq!(bitmap.pixel(1, 0), Some([255, 127, 0, 1]));
        assert_eq!(bitmap.pixel(2, 0), Some([40, 50, 60, 0]));
    }

    #[test]
    fn applying_twice_restores_original() {
        let mut bitmap = Bitmap::allocate(600, 400, DEFAULT_MAX_PIXELS).unwrap();
        for (i, byte) in bitmap.pixels_mut().iter_mut().enumerate() {
            *byte = (i * 7 % 251) as u8;
        }
        let original = bitmap.clone();

        invert_colors(&mut bitmap);
        assert_ne!(bitmap, original);
        invert_colors(&mut bitmap);
        assert_eq!(bitmap, original);
    }

    #[test]
    fn empty_bitmap_is_fine() {
        let mut bitmap = Bitmap::from_rgba(0, 0, Vec::new()).unwrap();
        invert_colors(&mut bitmap);
        assert!(bitmap.pixels().is_empty());
    }
}
