//! Bitmap rendering of cached timetable documents

mod bitmap;
mod cache;
mod decoder;
mod engine;
mod error;
mod invert;
#[cfg(feature = "pdf")]
mod mupdf;

pub use bitmap::{BYTES_PER_PIXEL, Bitmap, DEFAULT_MAX_PIXELS, scaled_dimensions};
pub use cache::DEFAULT_CAPACITY as DEFAULT_BITMAP_CACHE_CAPACITY;
pub use decoder::{DocumentDecoder, PageDecoder, Transform};
pub use engine::{Region, RenderEngine, RenderOptions};
pub use error::{DecodeError, RenderError};
pub use invert::invert_colors;
#[cfg(feature = "pdf")]
pub use mupdf::MupdfDecoder;
