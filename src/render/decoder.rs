//! Document decoder capability
//!
//! A decoder turns one cached file into pixels. Implementations are not
//! expected to be thread-safe; the [`RenderEngine`](super::RenderEngine)
//! only touches a [`PageDecoder`] while holding its render mutex.

use std::path::Path;

use super::bitmap::Bitmap;
use super::error::DecodeError;

/// Where the target bitmap sits on the scaled page.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    /// Output pixels per document unit
    pub scale: f32,
    /// Left edge of the target in scaled page pixels
    pub offset_x: f32,
    /// Top edge of the target in scaled page pixels
    pub offset_y: f32,
}

impl Transform {
    #[must_use]
    pub fn scale(scale: f32) -> Self {
        Self {
            scale,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    /// Map a target pixel centre back to document coordinates.
    #[must_use]
    pub fn to_document(&self, x: u32, y: u32) -> (f32, f32) {
        (
            (self.offset_x + x as f32 + 0.5) / self.scale,
            (self.offset_y + y as f32 + 0.5) / self.scale,
        )
    }
}

/// An open decode context for the first page of one document.
///
/// Dropping it releases the native context.
pub trait PageDecoder: Send {
    /// Native page size in document units.
    fn page_size(&self) -> (f32, f32);

    /// Draw the page with `transform` into `target`, whose size is chosen by
    /// the caller and must not change.
    fn render(&mut self, transform: Transform, target: &mut Bitmap) -> Result<(), DecodeError>;
}

/// Opens decode contexts for cached files.
pub trait DocumentDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn PageDecoder>, DecodeError>;
}
