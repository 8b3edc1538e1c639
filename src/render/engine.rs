//! Render engine: decoder lifetime and bitmap production
//!
//! One render mutex guards the handle table. Every render call takes it,
//! makes sure the only open handle is the one bound to the category's latest
//! cached file, decodes into an exactly sized bitmap and applies dark mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::bitmap::{Bitmap, DEFAULT_MAX_PIXELS, scaled_dimensions};
use super::cache::{BitmapCache, BitmapKey, DEFAULT_CAPACITY, RenderTarget};
use super::decoder::{DocumentDecoder, PageDecoder, Transform};
use super::error::{DecodeError, RenderError};
use super::invert::invert_colors;
use crate::category::Category;
use crate::sync::{CachedFile, DocumentCache};

const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    /// Largest bitmap a single call may allocate
    pub max_pixels: u64,
    /// Rendered bitmaps kept for repeated identical requests
    pub bitmap_cache_capacity: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_pixels: DEFAULT_MAX_PIXELS,
            bitmap_cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// A rectangle on the scaled page, in output pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with a `width` x `height` page anchored at the origin.
    #[must_use]
    pub fn clip(&self, width: u32, height: u32) -> Option<Self> {
        let x1 = self.x.saturating_add(self.width).min(width);
        let y1 = self.y.saturating_add(self.height).min(height);
        (self.x < x1 && self.y < y1).then(|| Self::new(self.x, self.y, x1 - self.x, y1 - self.y))
    }
}

/// An open decode context bound to exactly one cached file.
struct DecoderHandle {
    file: CachedFile,
    page: Box<dyn PageDecoder>,
}

struct HandleTable {
    handles: HashMap<Category, DecoderHandle>,
    bitmaps: BitmapCache,
}

struct Target {
    transform: Transform,
    width: u32,
    height: u32,
}

/// Suppresses repeats of render errors within a short window.
struct ErrorLog {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl ErrorLog {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(suppressed_count)` when a message may be written now.
    fn admit(&self, now: Instant) -> Option<u64> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|t| now.duration_since(t) < ERROR_LOG_INTERVAL) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        *last = Some(now);
        Some(self.suppressed.swap(0, Ordering::Relaxed))
    }

    fn report(&self, message: impl FnOnce() -> String) {
        match self.admit(Instant::now()) {
            Some(0) => error!("{}", message()),
            Some(n) => error!("{} ({n} similar errors suppressed)", message()),
            None => {}
        }
    }
}

pub struct RenderEngine {
    cache: DocumentCache,
    decoder: Arc<dyn DocumentDecoder>,
    options: RenderOptions,
    table: Mutex<HandleTable>,
    /// Retirements requested while a render held the table
    pending: Mutex<Vec<Category>>,
    errors: ErrorLog,
}

impl RenderEngine {
    pub fn new(cache: DocumentCache, decoder: Arc<dyn DocumentDecoder>, options: RenderOptions) -> Self {
        Self {
            cache,
            decoder,
            options,
            table: Mutex::new(HandleTable {
                handles: HashMap::new(),
                bitmaps: BitmapCache::new(options.bitmap_cache_capacity),
            }),
            pending: Mutex::new(Vec::new()),
            errors: ErrorLog::new(),
        }
    }

    #[must_use]
    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Render the whole page `width * zoom` pixels wide.
    pub fn render_page(
        &self,
        category: Category,
        width: u32,
        zoom: f32,
        dark_mode: bool,
    ) -> Result<Arc<Bitmap>, RenderError> {
        if width == 0 {
            return Err(RenderError::InvalidRequest("width must be positive".into()));
        }
        check_factor("zoom", zoom)?;

        let target_width = f64::from(width) * f64::from(zoom);
        self.render_with(category, dark_mode, |native| {
            let scale = (target_width / f64::from(native.0)) as f32;
            check_factor("scale", scale)?;
            let (width, height) = scaled_dimensions(native, scale);
            Ok(Target {
                transform: Transform::scale(scale),
                width,
                height,
            })
        })
    }

    /// Render one tile of the page as laid out at `scale`, subsampled by
    /// `sample_size`. The tile is clipped to the page.
    pub fn render_region(
        &self,
        category: Category,
        region: Region,
        scale: f32,
        sample_size: u32,
        dark_mode: bool,
    ) -> Result<Arc<Bitmap>, RenderError> {
        check_factor("scale", scale)?;
        if sample_size == 0 {
            return Err(RenderError::InvalidRequest("sample size must be at least 1".into()));
        }
        if region.width == 0 || region.height == 0 {
            return Err(RenderError::InvalidRequest(format!("empty region {region:?}")));
        }

        self.render_with(category, dark_mode, |native| {
            let (page_w, page_h) = scaled_dimensions(native, scale);
            let clipped = region.clip(page_w, page_h).ok_or_else(|| {
                RenderError::InvalidRequest(format!(
                    "region {region:?} lies outside the {page_w}x{page_h} page"
                ))
            })?;

            let sample = sample_size as f32;
            Ok(Target {
                transform: Transform {
                    scale: scale / sample,
                    offset_x: clipped.x as f32 / sample,
                    offset_y: clipped.y as f32 / sample,
                },
                width: clipped.width.div_ceil(sample_size),
                height: clipped.height.div_ceil(sample_size),
            })
        })
    }

    /// Full page size in pixels at `scale`.
    pub fn page_size(&self, category: Category, scale: f32) -> Result<(u32, u32), RenderError> {
        check_factor("scale", scale)?;
        let mut table = self.lock_table();
        let native = self.ensure_handle(&mut table, category)?.page.page_size();
        Ok(scaled_dimensions(native, scale))
    }

    /// The cached file a category's open handle is bound to, if any.
    #[must_use]
    pub fn bound_file(&self, category: Category) -> Option<CachedFile> {
        self.lock_table()
            .handles
            .get(&category)
            .map(|handle| handle.file.clone())
    }

    /// Close a category's handle; deferred to the next render call when one
    /// is running right now.
    pub fn retire(&self, category: Category) {
        self.retire_categories(&[category]);
    }

    pub fn retire_all(&self) {
        self.retire_categories(&Category::ALL);
    }

    /// Close every handle, waiting for a running render to finish.
    pub fn close(&self) {
        let mut table = self.lock_table();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for category in Category::ALL {
            close_handle(&mut table, category);
        }
        table.bitmaps.invalidate_all();
    }

    fn retire_categories(&self, categories: &[Category]) {
        let mut table = match self.table.try_lock() {
            Ok(table) => table,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("Render in progress, deferring retirement of {categories:?}");
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(categories);
                return;
            }
        };
        for category in categories {
            close_handle(&mut table, *category);
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, HandleTable> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        for category in pending {
            close_handle(&mut table, category);
        }
        table
    }

    fn render_with(
        &self,
        category: Category,
        dark_mode: bool,
        plan: impl FnOnce((f32, f32)) -> Result<Target, RenderError>,
    ) -> Result<Arc<Bitmap>, RenderError> {
        let mut table = self.lock_table();

        let (identity, native) = {
            let handle = self.ensure_handle(&mut table, category)?;
            (handle.file.identity_key.clone(), handle.page.page_size())
        };

        let target = plan(native)?;
        let key = BitmapKey {
            identity,
            target: RenderTarget::new(target.width, target.height, target.transform),
            dark_mode,
        };
        if let Some(hit) = table.bitmaps.get(category, &key) {
            return Ok(hit);
        }

        let mut bitmap = Bitmap::allocate(target.width, target.height, self.options.max_pixels)
            .inspect_err(|e| self.errors.report(|| format!("Render of {category} skipped: {e}")))?;

        let decoded = match table.handles.get_mut(&category) {
            Some(handle) => handle.page.render(target.transform, &mut bitmap),
            None => return Err(RenderError::NoCachedFile(category)),
        };
        match decoded {
            Ok(()) => {}
            // The document is fine; only this size could not be produced.
            Err(source) if source.is_out_of_memory() => {
                self.errors
                    .report(|| format!("Decoder ran out of memory rendering {category}: {source}"));
                return Err(RenderError::OutOfMemory {
                    width: u64::from(target.width),
                    height: u64::from(target.height),
                });
            }
            Err(source) => return Err(self.decode_failed(&mut table, category, source)),
        }

        if dark_mode {
            invert_colors(&mut bitmap);
        }
        Ok(table.bitmaps.insert(category, key, bitmap))
    }

    /// Make the category's handle the only open one, bound to its latest
    /// cached file.
    fn ensure_handle<'t>(
        &self,
        table: &'t mut HandleTable,
        category: Category,
    ) -> Result<&'t mut DecoderHandle, RenderError> {
        let foreign: Vec<Category> = table
            .handles
            .keys()
            .copied()
            .filter(|other| *other != category)
            .collect();
        for other in foreign {
            close_handle(table, other);
        }

        let Some(latest) = self.cache.latest(category) else {
            close_handle(table, category);
            return Err(RenderError::NoCachedFile(category));
        };

        if table
            .handles
            .get(&category)
            .is_some_and(|handle| handle.file != latest)
        {
            close_handle(table, category);
        }

        if !table.handles.contains_key(&category) {
            let page = match self.decoder.open(&latest.path) {
                Ok(page) => page,
                Err(source) => return Err(self.decode_failed(table, category, source)),
            };
            info!("Opened decoder for {category}: {}", latest.path.display());
            table.handles.insert(category, DecoderHandle { file: latest, page });
        }

        table
            .handles
            .get_mut(&category)
            .ok_or(RenderError::NoCachedFile(category))
    }

    fn decode_failed(&self, table: &mut HandleTable, category: Category, source: DecodeError) -> RenderError {
        self.errors
            .report(|| format!("Cached {category} document is unreadable: {source}"));
        close_handle(table, category);
        if let Err(e) = self.cache.clear(category) {
            warn!("Failed to invalidate {category} cache: {e}");
        }
        RenderError::DecodeFailed { category, source }
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_handle(table: &mut HandleTable, category: Category) {
    if let Some(handle) = table.handles.remove(&category) {
        debug!("Closing decoder for {category} ({})", handle.file.identity_key);
    }
    table.bitmaps.invalidate_category(category);
}

fn check_factor(name: &str, value: f32) -> Result<(), RenderError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(RenderError::InvalidRequest(format!("{name} must be positive, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::sync::RemoteDocumentRef;
    use crate::test_utils::fakes::{SyntheticDecoder, write_synthetic_document};

    struct Fixture {
        _tmp: TempDir,
        cache: DocumentCache,
        decoder: Arc<SyntheticDecoder>,
        engine: RenderEngine,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let cache = DocumentCache::new(tmp.path()).unwrap();
        let decoder = Arc::new(SyntheticDecoder::new());
        let engine = RenderEngine::new(cache.clone(), decoder.clone(), RenderOptions::default());
        Fixture {
            _tmp: tmp,
            cache,
            decoder,
            engine,
        }
    }

    fn place(cache: &DocumentCache, category: Category, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let doc = RemoteDocumentRef::new(category, format!("https://example.org/{name}"));
        let path = cache.path_for(&doc).unwrap();
        write_synthetic_document(&path, w, h).unwrap();
        path
    }

    #[test]
    fn render_without_cached_file() {
        let f = fixture();
        let err = f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap_err();
        assert!(matches!(err, RenderError::NoCachedFile(Category::Primary)));
    }

    #[test]
    fn page_is_scaled_to_width_times_zoom() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        let bitmap = f.engine.render_page(Category::Primary, 500, 1.5, false).unwrap();
        assert_eq!(bitmap.dimensions(), (750, 1200));
        assert_eq!(f.engine.page_size(Category::Primary, 0.5).unwrap(), (250, 400));
    }

    #[test]
    fn region_is_subsampled_and_clipped() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        // Page at scale 2 is 1000x1600; the tile runs past its right edge.
        let tile = f
            .engine
            .render_region(Category::Primary, Region::new(800, 0, 400, 256), 2.0, 4, false)
            .unwrap();
        assert_eq!(tile.dimensions(), (50, 64));

        let outside = f
            .engine
            .render_region(Category::Primary, Region::new(2000, 0, 10, 10), 2.0, 1, false)
            .unwrap_err();
        assert!(matches!(outside, RenderError::InvalidRequest(_)));
    }

    #[test]
    fn region_matches_the_same_area_of_a_page_render() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        let page = f.engine.render_page(Category::Primary, 500, 1.0, false).unwrap();
        let tile = f
            .engine
            .render_region(Category::Primary, Region::new(100, 200, 50, 50), 1.0, 1, false)
            .unwrap();
        for (x, y) in [(0, 0), (10, 20), (49, 49)] {
            assert_eq!(tile.pixel(x, y), page.pixel(100 + x, 200 + y));
        }
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);
        for result in [
            f.engine.render_page(Category::Primary, 0, 1.0, false),
            f.engine.render_page(Category::Primary, 10, 0.0, false),
            f.engine.render_page(Category::Primary, 10, f32::NAN, false),
            f.engine.render_region(Category::Primary, Region::new(0, 0, 10, 10), 1.0, 0, false),
        ] {
            assert!(matches!(result, Err(RenderError::InvalidRequest(_))));
        }
    }

    #[test]
    fn oversized_render_is_out_of_memory_and_recoverable() {
        let tmp = TempDir::new().unwrap();
        let cache = DocumentCache::new(tmp.path()).unwrap();
        let engine = RenderEngine::new(
            cache.clone(),
            Arc::new(SyntheticDecoder::new()),
            RenderOptions {
                max_pixels: 100_000,
                ..RenderOptions::default()
            },
        );
        place(&cache, Category::Primary, "plan.pdf", 500, 800);

        let err = engine.render_page(Category::Primary, 1000, 1.0, false).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory { .. }));
        assert!(err.is_transient());

        assert!(engine.render_page(Category::Primary, 100, 1.0, false).is_ok());
        assert!(cache.latest(Category::Primary).is_some());
    }

    #[test]
    fn decoder_allocation_failure_keeps_the_cached_file() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);
        f.decoder.starve_next_render();

        let err = f.engine.render_region(Category::Primary, Region::new(0, 0, 256, 256), 20.0, 1, false);
        assert!(matches!(
            err,
            Err(RenderError::OutOfMemory {
                width: 256,
                height: 256
            })
        ));
        assert!(f.cache.latest(Category::Primary).is_some());
        assert!(f.engine.bound_file(Category::Primary).is_some());

        let tile = f
            .engine
            .render_region(Category::Primary, Region::new(0, 0, 256, 256), 20.0, 1, false)
            .unwrap();
        assert_eq!(tile.dimensions(), (256, 256));
        assert_eq!(f.decoder.stats().opened().len(), 1);
    }

    #[test]
    fn large_zooms_get_their_own_bitmaps() {
        let f = fixture();
        place(&f.cache, Category::Primary, "strip.pdf", 5000, 1);

        let a = f.engine.render_page(Category::Primary, 1, 5000.0, false).unwrap();
        let b = f.engine.render_page(Category::Primary, 1, 6000.0, false).unwrap();
        assert_eq!(a.width(), 5000);
        assert_eq!(b.width(), 6000);
        assert_eq!(f.decoder.stats().renders(), 2);
    }

    #[test]
    fn neighbouring_region_scales_are_not_merged() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);
        let region = Region::new(0, 0, 64, 64);
        let next_up = f32::from_bits(1.0f32.to_bits() + 1);

        let a = f.engine.render_region(Category::Primary, region, 1.0, 1, false).unwrap();
        let b = f.engine.render_region(Category::Primary, region, next_up, 1, false).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(f.decoder.stats().renders(), 2);
    }

    #[test]
    fn requests_for_the_same_target_share_a_bitmap() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        let zoomed = f.engine.render_page(Category::Primary, 250, 2.0, false).unwrap();
        let wide = f.engine.render_page(Category::Primary, 500, 1.0, false).unwrap();
        assert!(Arc::ptr_eq(&zoomed, &wide));
        assert_eq!(f.decoder.stats().renders(), 1);
    }

    #[test]
    fn corrupt_file_clears_cache_and_retires_handle() {
        let f = fixture();
        let path = place(&f.cache, Category::Primary, "plan.pdf", 500, 800);
        std::fs::write(&path, b"not a document").unwrap();

        let err = f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap_err();
        assert!(matches!(
            err,
            RenderError::DecodeFailed {
                category: Category::Primary,
                ..
            }
        ));
        assert!(f.cache.latest(Category::Primary).is_none());
        assert!(f.engine.bound_file(Category::Primary).is_none());
    }

    #[test]
    fn one_handle_at_a_time() {
        let f = fixture();
        place(&f.cache, Category::Primary, "a.pdf", 500, 800);
        place(&f.cache, Category::Secondary, "b.pdf", 300, 300);

        f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        f.engine.render_page(Category::Secondary, 100, 1.0, false).unwrap();

        let stats = f.decoder.stats();
        assert_eq!(stats.opened().len(), 2);
        assert_eq!(stats.live(), 1);
        assert!(f.engine.bound_file(Category::Primary).is_none());
        assert_eq!(
            f.engine.bound_file(Category::Secondary).unwrap().identity_key,
            "b.pdf"
        );
    }

    #[test]
    fn handle_is_reused_until_the_file_changes() {
        let f = fixture();
        place(&f.cache, Category::Primary, "week1.pdf", 500, 800);

        f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        f.engine.render_page(Category::Primary, 200, 1.0, false).unwrap();
        assert_eq!(f.decoder.stats().opened().len(), 1);

        let newer = place(&f.cache, Category::Primary, "week2.pdf", 400, 400);
        let later = std::time::SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&newer)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let bitmap = f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        assert_eq!(bitmap.dimensions(), (100, 100));
        let opened = f.decoder.stats().opened();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[1].file_name(), Path::new("week2.pdf").file_name());
        assert_eq!(f.decoder.stats().live(), 1);
    }

    #[test]
    fn identical_requests_hit_the_bitmap_cache() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        let a = f.engine.render_page(Category::Primary, 100, 1.0, true).unwrap();
        let b = f.engine.render_page(Category::Primary, 100, 1.0, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.decoder.stats().renders(), 1);

        let light = f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        assert!(!Arc::ptr_eq(&a, &light));
        assert_eq!(f.decoder.stats().renders(), 2);
    }

    #[test]
    fn retire_and_close_release_handles() {
        let f = fixture();
        place(&f.cache, Category::Primary, "plan.pdf", 500, 800);

        f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        f.engine.retire(Category::Primary);
        assert_eq!(f.decoder.stats().live(), 0);

        f.engine.render_page(Category::Primary, 100, 1.0, false).unwrap();
        assert_eq!(f.decoder.stats().opened().len(), 2);
        f.engine.close();
        assert_eq!(f.decoder.stats().live(), 0);
    }

    #[test]
    fn error_log_suppresses_bursts() {
        let log = ErrorLog::new();
        let start = Instant::now();
        assert_eq!(log.admit(start), Some(0));
        assert_eq!(log.admit(start + Duration::from_millis(10)), None);
        assert_eq!(log.admit(start + Duration::from_millis(20)), None);
        assert_eq!(log.admit(start + ERROR_LOG_INTERVAL * 2), Some(2));
    }

    #[test]
    fn region_clip() {
        assert_eq!(Region::new(5, 5, 10, 10).clip(8, 100), Some(Region::new(5, 5, 3, 10)));
        assert_eq!(Region::new(10, 0, 5, 5).clip(10, 10), None);
    }
}
