//! Rendered bitmaps kept per category, keyed by the exact render target

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::bitmap::Bitmap;
use super::decoder::Transform;
use crate::category::Category;

pub const DEFAULT_CAPACITY: usize = 8;

/// The output a render produces from a given file: bitmap size plus the page
/// transform. Floats are compared bit for bit, so two requests share an entry
/// only when they would draw identical pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    scale: u32,
    offset_x: u32,
    offset_y: u32,
}

impl RenderTarget {
    #[must_use]
    pub fn new(width: u32, height: u32, transform: Transform) -> Self {
        Self {
            width,
            height,
            scale: transform.scale.to_bits(),
            offset_x: transform.offset_x.to_bits(),
            offset_y: transform.offset_y.to_bits(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BitmapKey {
    /// Identity key of the cached file the bitmap came from
    pub identity: String,
    pub target: RenderTarget,
    pub dark_mode: bool,
}

/// One LRU per category; a category's bitmaps go away with its decoder.
pub struct BitmapCache {
    capacity: NonZeroUsize,
    categories: HashMap<Category, LruCache<BitmapKey, Arc<Bitmap>>>,
}

impl BitmapCache {
    /// `capacity` bitmaps per category, at least one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            categories: HashMap::new(),
        }
    }

    pub fn get(&mut self, category: Category, key: &BitmapKey) -> Option<Arc<Bitmap>> {
        self.categories.get_mut(&category)?.get(key).cloned()
    }

    pub fn insert(&mut self, category: Category, key: BitmapKey, bitmap: Bitmap) -> Arc<Bitmap> {
        let bitmap = Arc::new(bitmap);
        self.categories
            .entry(category)
            .or_insert_with(|| LruCache::new(self.capacity))
            .put(key, Arc::clone(&bitmap));
        bitmap
    }

    pub fn invalidate_category(&mut self, category: Category) {
        self.categories.remove(&category);
    }

    pub fn invalidate_all(&mut self) {
        self.categories.clear();
    }
}
