pub mod fakes {
    //! In-memory stand-ins for the external capabilities: config service,
    //! transfer engine, reachability and document decoder.

    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use flume::{Receiver, Sender};

    use crate::category::Category;
    use crate::render::{Bitmap, DecodeError, DocumentDecoder, PageDecoder, Transform};
    use crate::sync::{
        ConfigError, KeyValueConfig, Reachability, TransferEngine, TransferError, TransferEvent,
        TransferHandle, TransferListener, TransferRequest,
    };

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- config ----

    /// Key/value config that counts its calls.
    #[derive(Default)]
    pub struct FakeConfig {
        values: Mutex<HashMap<String, String>>,
        refresh_error: Mutex<Option<String>>,
        refresh_calls: AtomicUsize,
        get_calls: AtomicUsize,
    }

    impl FakeConfig {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_url(self, category: Category, url: &str) -> Self {
            self.set_url(category, url);
            self
        }

        pub fn set_url(&self, category: Category, url: &str) {
            lock(&self.values).insert(category.config_key().to_string(), url.to_string());
        }

        /// Make every later refresh fail with `detail`.
        pub fn fail_refresh(&self, detail: &str) {
            *lock(&self.refresh_error) = Some(detail.to_string());
        }

        pub fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        pub fn get_calls(&self) -> usize {
            self.get_calls.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> usize {
            self.refresh_calls() + self.get_calls()
        }
    }

    impl KeyValueConfig for FakeConfig {
        fn refresh_and_activate(&self) -> Result<bool, ConfigError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            match lock(&self.refresh_error).clone() {
                Some(detail) => Err(ConfigError::Unreachable(detail)),
                None => Ok(false),
            }
        }

        fn get(&self, key: &str) -> Option<String> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.values).get(key).cloned()
        }
    }

    // ---- reachability ----

    /// Switchable network state that counts checks.
    pub struct FakeNetwork {
        up: AtomicBool,
        checks: AtomicUsize,
    }

    impl FakeNetwork {
        pub fn up() -> Self {
            Self {
                up: AtomicBool::new(true),
                checks: AtomicUsize::new(0),
            }
        }

        pub fn down() -> Self {
            let network = Self::up();
            network.set(false);
            network
        }

        pub fn set(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }

        pub fn checks(&self) -> usize {
            self.checks.load(Ordering::SeqCst)
        }
    }

    impl Reachability for FakeNetwork {
        fn is_reachable(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.up.load(Ordering::SeqCst)
        }
    }

    // ---- transfer engine ----

    struct Job {
        handle: TransferHandle,
        request: TransferRequest,
        listener: Option<TransferListener>,
    }

    /// Transfer engine driven by the test.
    ///
    /// Each `script` call queues the events the next `enqueue` delivers
    /// synchronously; without a script the transfer stays pending until
    /// `emit_last`. `Completed` writes the payload (if any) to the request's
    /// destination before it is delivered.
    #[derive(Default)]
    pub struct ScriptedEngine {
        next_id: AtomicU64,
        scripts: Mutex<VecDeque<Vec<TransferEvent>>>,
        jobs: Mutex<Vec<Job>>,
        detached: Mutex<Vec<TransferHandle>>,
        aborted: Mutex<Vec<TransferHandle>>,
        fail_next: AtomicBool,
        payload: Mutex<Option<Vec<u8>>>,
    }

    impl ScriptedEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Bytes written to the destination on `Completed`.
        pub fn with_payload(self, payload: Vec<u8>) -> Self {
            *lock(&self.payload) = Some(payload);
            self
        }

        pub fn script(&self, events: Vec<TransferEvent>) {
            lock(&self.scripts).push_back(events);
        }

        pub fn fail_next_enqueue(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        pub fn enqueued(&self) -> Vec<TransferRequest> {
            lock(&self.jobs).iter().map(|job| job.request.clone()).collect()
        }

        pub fn detached(&self) -> Vec<TransferHandle> {
            lock(&self.detached).clone()
        }

        pub fn aborted(&self) -> Vec<TransferHandle> {
            lock(&self.aborted).clone()
        }

        /// Deliver `event` to the most recent transfer, unless detached.
        pub fn emit_last(&self, event: TransferEvent) {
            let target = lock(&self.jobs).last().map(|job| job.handle);
            if let Some(handle) = target {
                self.emit(handle, event);
            }
        }

        pub fn emit(&self, handle: TransferHandle, event: TransferEvent) {
            let found = lock(&self.jobs)
                .iter()
                .find(|job| job.handle == handle)
                .map(|job| (job.listener.clone(), job.request.destination.clone()));
            let Some((listener, destination)) = found else {
                return;
            };

            if event == TransferEvent::Completed {
                if let Some(payload) = lock(&self.payload).clone() {
                    if let Err(e) = fs::write(&destination, payload) {
                        panic!("cannot write fake download to {}: {e}", destination.display());
                    }
                }
            }
            if let Some(listener) = listener {
                listener(event);
            }
        }
    }

    impl TransferEngine for ScriptedEngine {
        fn enqueue(
            &self,
            request: TransferRequest,
            listener: TransferListener,
        ) -> Result<TransferHandle, TransferError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TransferError::engine("scripted enqueue failure"));
            }

            let handle = TransferHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            lock(&self.jobs).push(Job {
                handle,
                request,
                listener: Some(listener),
            });

            let events = lock(&self.scripts).pop_front().unwrap_or_default();
            for event in events {
                self.emit(handle, event);
            }
            Ok(handle)
        }

        fn detach(&self, handle: TransferHandle) {
            lock(&self.detached).push(handle);
            if let Some(job) = lock(&self.jobs).iter_mut().find(|job| job.handle == handle) {
                job.listener = None;
            }
        }

        fn abort(&self, handle: TransferHandle) {
            lock(&self.aborted).push(handle);
        }
    }

    // ---- decoder ----

    const SYNTHETIC_MAGIC: &str = "SYNTHETIC";

    /// Pixels left of this document x coordinate are fully transparent.
    pub const TRANSPARENT_MARGIN: f32 = 20.0;

    pub fn synthetic_document(width: u32, height: u32) -> Vec<u8> {
        format!("{SYNTHETIC_MAGIC} {width}x{height}\n").into_bytes()
    }

    /// Write a document the [`SyntheticDecoder`] opens as a `width` x
    /// `height` page.
    pub fn write_synthetic_document(path: &Path, width: u32, height: u32) -> io::Result<()> {
        fs::write(path, synthetic_document(width, height))
    }

    /// The colour the synthetic page has at document coordinates (x, y).
    pub fn synthetic_pixel(x: f32, y: f32) -> [u8; 4] {
        let alpha = if x < TRANSPARENT_MARGIN { 0 } else { 255 };
        [(x as u32 % 256) as u8, (y as u32 % 256) as u8, 200, alpha]
    }

    fn parse_synthetic(bytes: &[u8]) -> Option<(f32, f32)> {
        let text = std::str::from_utf8(bytes).ok()?;
        let dims = text.trim().strip_prefix(SYNTHETIC_MAGIC)?.trim();
        let (w, h) = dims.split_once('x')?;
        Some((w.parse::<u32>().ok()? as f32, h.parse::<u32>().ok()? as f32))
    }

    #[derive(Default)]
    pub struct DecoderStats {
        opened: Mutex<Vec<PathBuf>>,
        closed: AtomicUsize,
        renders: AtomicUsize,
    }

    impl DecoderStats {
        /// Files opened so far, in order.
        pub fn opened(&self) -> Vec<PathBuf> {
            lock(&self.opened).clone()
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        /// Handles currently open.
        pub fn live(&self) -> usize {
            lock(&self.opened).len() - self.closed()
        }

        pub fn renders(&self) -> usize {
            self.renders.load(Ordering::SeqCst)
        }
    }

    struct Hold {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    /// Ends of a held render: `entered` fires once the render is inside the
    /// decoder, sending on `release` lets it finish.
    pub struct RenderHold {
        pub entered: Receiver<()>,
        pub release: Sender<()>,
    }

    /// Decoder for synthetic documents with deterministic pixels.
    #[derive(Default)]
    pub struct SyntheticDecoder {
        stats: Arc<DecoderStats>,
        hold: Arc<Mutex<Option<Hold>>>,
        starve: Arc<AtomicBool>,
    }

    impl SyntheticDecoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn stats(&self) -> Arc<DecoderStats> {
            Arc::clone(&self.stats)
        }

        /// Block the next render inside the decoder until released.
        pub fn hold_next_render(&self) -> RenderHold {
            let (entered_tx, entered_rx) = flume::bounded(1);
            let (release_tx, release_rx) = flume::bounded(1);
            *lock(&self.hold) = Some(Hold {
                entered: entered_tx,
                release: release_rx,
            });
            RenderHold {
                entered: entered_rx,
                release: release_tx,
            }
        }

        /// Fail the next render as if the decoder could not allocate.
        pub fn starve_next_render(&self) {
            self.starve.store(true, Ordering::SeqCst);
        }
    }

    impl DocumentDecoder for SyntheticDecoder {
        fn open(&self, path: &Path) -> Result<Box<dyn PageDecoder>, DecodeError> {
            let bytes = fs::read(path)?;
            let size = parse_synthetic(&bytes)
                .ok_or_else(|| DecodeError::generic(format!("{} is not a document", path.display())))?;
            lock(&self.stats.opened).push(path.to_path_buf());
            Ok(Box::new(SyntheticPage {
                size,
                stats: Arc::clone(&self.stats),
                hold: Arc::clone(&self.hold),
                starve: Arc::clone(&self.starve),
            }))
        }
    }

    struct SyntheticPage {
        size: (f32, f32),
        stats: Arc<DecoderStats>,
        hold: Arc<Mutex<Option<Hold>>>,
        starve: Arc<AtomicBool>,
    }

    impl PageDecoder for SyntheticPage {
        fn page_size(&self) -> (f32, f32) {
            self.size
        }

        fn render(&mut self, transform: Transform, target: &mut Bitmap) -> Result<(), DecodeError> {
            let hold = lock(&self.hold).take();
            if let Some(hold) = hold {
                let _ = hold.entered.send(());
                let _ = hold.release.recv();
            }

            if self.starve.swap(false, Ordering::SeqCst) {
                return Err(DecodeError::OutOfMemory {
                    detail: format!("{}x{} target", target.width(), target.height()),
                });
            }

            self.stats.renders.fetch_add(1, Ordering::SeqCst);
            for y in 0..target.height() {
                for x in 0..target.width() {
                    let (dx, dy) = transform.to_document(x, y);
                    target.set_pixel(x, y, synthetic_pixel(dx, dy));
                }
            }
            Ok(())
        }
    }

    impl Drop for SyntheticPage {
        fn drop(&mut self) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn synthetic_documents_parse() {
            assert_eq!(parse_synthetic(&synthetic_document(500, 800)), Some((500.0, 800.0)));
            assert_eq!(parse_synthetic(b"%PDF-1.7"), None);
        }

        #[test]
        fn scripted_engine_stops_delivering_after_detach() {
            let engine = ScriptedEngine::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let listener: TransferListener = Arc::new(move |event| lock(&sink).push(event));

            let handle = engine
                .enqueue(
                    TransferRequest {
                        url: "https://example.org/a.pdf".into(),
                        destination: PathBuf::from("/nonexistent/a.pdf"),
                        priority: Default::default(),
                        network_policy: Default::default(),
                    },
                    listener,
                )
                .unwrap();
            engine.emit_last(TransferEvent::Queued);
            engine.detach(handle);
            engine.emit_last(TransferEvent::Cancelled);

            assert_eq!(*lock(&seen), vec![TransferEvent::Queued]);
            assert_eq!(engine.detached(), vec![handle]);
        }
    }
}
