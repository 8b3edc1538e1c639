//! Orchestration of config resolution, caching, downloads and decoder retirement

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::Serialize;

use super::cache::DocumentCache;
use super::config::{ConfigResolver, KeyValueConfig};
use super::network::Reachability;
use super::state::{Command, Effect, Phase, SyncState};
use super::transfer::TransferCoordinator;
use super::types::{DownloadSession, FailReason, SessionId, SyncResult, SyncUpdate};
use crate::category::Category;
use crate::render::RenderEngine;

/// How often a waiting refresh checks whether it was superseded.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything the state machine drives.
pub struct SyncParts {
    pub config: Arc<dyn KeyValueConfig>,
    pub cache: DocumentCache,
    pub transfers: TransferCoordinator,
    pub reachability: Arc<dyn Reachability>,
    pub renderer: Arc<RenderEngine>,
}

/// Serializable snapshot of one category.
#[derive(Clone, Debug, Serialize)]
pub struct CategoryStatus {
    pub category: Category,
    pub selected: bool,
    pub phase: Phase,
    pub result: Option<SyncResult>,
    pub cached_file: Option<PathBuf>,
    pub cached_bytes: Option<u64>,
    pub cached_at: Option<DateTime<Utc>>,
    pub download: Option<DownloadSession>,
}

struct Inner {
    resolver: ConfigResolver<Arc<dyn KeyValueConfig>>,
    cache: DocumentCache,
    transfers: TransferCoordinator,
    reachability: Arc<dyn Reachability>,
    renderer: Arc<RenderEngine>,
    state: Mutex<SyncState>,
    /// Held for the whole of a refresh attempt, one per category
    gates: [Mutex<()>; 2],
    subscribers: Mutex<Vec<Sender<SyncUpdate>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// The per-category `Idle -> Loading -> Success | Fail` model and the flow
/// that feeds it.
pub struct SyncStateMachine {
    inner: Arc<Inner>,
}

impl SyncStateMachine {
    pub fn new(parts: SyncParts, selected: Category) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver: ConfigResolver::new(parts.config),
                cache: parts.cache,
                transfers: parts.transfers,
                reachability: parts.reachability,
                renderer: parts.renderer,
                state: Mutex::new(SyncState::new(selected)),
                gates: [Mutex::new(()), Mutex::new(())],
                subscribers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Run one refresh of `category` on the calling thread.
    ///
    /// Returns the terminal result, or `None` when a refresh for the category
    /// was already running or this one was superseded.
    pub fn refresh(&self, category: Category) -> Option<SyncResult> {
        self.inner.refresh(category)
    }

    pub fn refresh_in_background(&self, category: Category) {
        Inner::spawn_refresh(&self.inner, category);
    }

    /// Select `category`, retire the previous category's decoder and start
    /// refreshing the new one in the background.
    pub fn switch_category(&self, category: Category) {
        info!("Switching to {category}");
        Inner::execute(&self.inner, Command::Select(category));
    }

    /// Publish `Success` right away when an earlier download is cached.
    pub fn preload(&self, category: Category) -> bool {
        if self.inner.cache.latest(category).is_none() {
            return false;
        }
        Inner::execute(&self.inner, Command::CachedAvailable(category));
        true
    }

    /// The remote documents changed: drop every cached file and decoder, then
    /// refresh the selected category.
    pub fn content_changed(&self) {
        info!("Remote content changed, invalidating caches");
        Inner::execute(&self.inner, Command::ContentChanged);
    }

    #[must_use]
    pub fn selected(&self) -> Category {
        self.inner.lock_state().selected()
    }

    #[must_use]
    pub fn current(&self, category: Category) -> Option<SyncResult> {
        self.inner.lock_state().current(category)
    }

    #[must_use]
    pub fn phase(&self, category: Category) -> Phase {
        self.inner.lock_state().phase(category)
    }

    #[must_use]
    pub fn active_session(&self, category: Category) -> Option<DownloadSession> {
        self.inner.transfers.active_session(category)
    }

    #[must_use]
    pub fn renderer(&self) -> &Arc<RenderEngine> {
        &self.inner.renderer
    }

    #[must_use]
    pub fn cache(&self) -> &DocumentCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn status(&self) -> Vec<CategoryStatus> {
        let state = self.inner.lock_state().clone();
        Category::ALL
            .iter()
            .map(|category| {
                let cached = self.inner.cache.latest(*category);
                CategoryStatus {
                    category: *category,
                    selected: state.selected() == *category,
                    phase: state.phase(*category),
                    result: state.current(*category),
                    cached_bytes: cached.as_ref().map(|file| file.size_bytes),
                    cached_at: cached.as_ref().map(|file| DateTime::<Utc>::from(file.modified)),
                    cached_file: cached.map(|file| file.path),
                    download: self.inner.transfers.active_session(*category),
                }
            })
            .collect()
    }

    /// Receive every published update from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = flume::unbounded();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription {
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Wait for background refreshes started so far.
    pub fn join_background(&self) {
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                error!("Refresh worker panicked");
            }
        }
    }

    /// Release transfer listeners, close decoders and wait for workers.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down sync state machine");
        self.inner.transfers.shutdown();
        self.join_background();
        self.inner.renderer.close();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for SyncStateMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, category: Category) -> &Mutex<()> {
        match category {
            Category::Primary => &self.gates[0],
            Category::Secondary => &self.gates[1],
        }
    }

    /// Apply a command, publishing under the state lock so subscribers see
    /// updates in state order.
    fn apply(&self, cmd: Command) -> Vec<Effect> {
        let mut state = self.lock_state();
        let effects = state.apply(cmd);

        let mut rest = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::Publish(update) => self.publish(update),
                Effect::Discarded(update) => {
                    debug!("Discarding stale update {update:?}");
                    rest.push(Effect::Discarded(update));
                }
                other => rest.push(other),
            }
        }
        rest
    }

    /// Apply a command and carry out its side effects.
    fn execute(this: &Arc<Self>, cmd: Command) -> Vec<Effect> {
        let effects = this.apply(cmd);
        for effect in &effects {
            match effect {
                Effect::RetireDecoder(category) => this.renderer.retire(*category),
                Effect::RetireAllDecoders => this.renderer.retire_all(),
                Effect::ClearCache => {
                    if let Err(e) = this.cache.clear_all() {
                        warn!("Failed to clear document cache: {e}");
                    }
                }
                Effect::Refresh(category) => Self::spawn_refresh(this, *category),
                Effect::Started(_) | Effect::Publish(_) | Effect::Discarded(_) => {}
            }
        }
        effects
    }

    fn publish(&self, update: SyncUpdate) {
        debug!("Publishing {update:?}");
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(update).is_ok());
    }

    fn spawn_refresh(this: &Arc<Self>, category: Category) {
        if this.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(this);
        let spawned = std::thread::Builder::new()
            .name(format!("refresh-{}", category.as_str()))
            .spawn(move || {
                inner.refresh(category);
            });

        match spawned {
            Ok(handle) => {
                let mut workers = this.workers.lock().unwrap_or_else(PoisonError::into_inner);
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
            }
            Err(e) => error!("Failed to spawn refresh worker for {category}: {e}"),
        }
    }

    fn refresh(&self, category: Category) -> Option<SyncResult> {
        let attempt = match self.apply(Command::BeginRefresh(category)).as_slice() {
            [Effect::Started(attempt)] => *attempt,
            _ => {
                debug!("Refresh of {category} already running");
                return None;
            }
        };

        // A superseded attempt may still be tearing down its download.
        let _gate = self.gate(category).lock().unwrap_or_else(PoisonError::into_inner);
        if !self.lock_state().is_live(category, attempt) {
            return None;
        }

        let result = self.run_attempt(category, attempt);
        if let Some(result) = result {
            info!("Refresh of {category} finished: {result:?}");
        }
        result
    }

    fn fail(&self, category: Category, attempt: SessionId, reason: FailReason) -> Option<SyncResult> {
        self.finish(category, attempt, SyncResult::fail(reason))
    }

    fn finish(&self, category: Category, attempt: SessionId, result: SyncResult) -> Option<SyncResult> {
        let effects = self.apply(Command::Deliver {
            category,
            attempt,
            result,
        });
        if effects.is_empty() { Some(result) } else { None }
    }

    fn abandon(&self, category: Category, attempt: SessionId) -> Option<SyncResult> {
        let _ = self.apply(Command::Abandon { category, attempt });
        None
    }

    fn run_attempt(&self, category: Category, attempt: SessionId) -> Option<SyncResult> {
        if !self.reachability.is_reachable() {
            info!("Network unreachable, not refreshing {category}");
            return self.fail(category, attempt, FailReason::NoNetwork);
        }
        let _ = self.apply(Command::Announce { category, attempt });

        let doc = match self.resolver.resolve(category) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Cannot resolve {category} document: {e}");
                return self.fail(category, attempt, e.fail_reason());
            }
        };

        if self.cache.exists(&doc) {
            debug!("{category} document {} already cached", doc.url);
            let result = self.finish(category, attempt, SyncResult::Success);
            self.evict_superseded(category, doc.identity_key());
            return result;
        }

        let destination = match self.cache.path_for(&doc) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot place {category} document: {e}");
                return self.fail(category, attempt, FailReason::TransferFailed);
            }
        };

        if self.shutting_down.load(Ordering::SeqCst) {
            return self.abandon(category, attempt);
        }
        let stream = match self.transfers.start(&doc, destination) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot start {category} download: {e}");
                return self.fail(category, attempt, FailReason::TransferFailed);
            }
        };

        loop {
            match stream.recv_timeout(POLL_INTERVAL) {
                Ok(update) => {
                    let terminal = update.result.is_terminal();
                    let effects = self.apply(Command::Deliver {
                        category,
                        attempt,
                        result: update.result,
                    });
                    if !effects.is_empty() {
                        // Superseded while the update was in flight.
                        return None;
                    }
                    if terminal {
                        if update.result == SyncResult::Success {
                            self.evict_superseded(category, doc.identity_key());
                        }
                        return Some(update.result);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return self.abandon(category, attempt);
                    }
                    if !self.lock_state().is_live(category, attempt) {
                        debug!("{category} refresh superseded, detaching");
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("{category} download removed without a result");
                    return self.abandon(category, attempt);
                }
            }
        }
    }

    /// Keep one cached file per category.
    fn evict_superseded(&self, category: Category, keep: Option<String>) {
        let Some(keep) = keep else {
            return;
        };
        match self.cache.retain_only(category, &keep) {
            Ok(0) => {}
            Ok(n) => debug!("Evicted {n} superseded {category} files"),
            Err(e) => warn!("Failed to evict superseded {category} files: {e}"),
        }
    }
}

/// A subscriber's view of published updates.
pub struct Subscription {
    rx: Receiver<SyncUpdate>,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Block for the next update; `None` once the machine is gone.
    pub fn recv(&self) -> Option<SyncUpdate> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<SyncUpdate> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Updates received so far, without blocking.
    pub fn drain(&self) -> Vec<SyncUpdate> {
        self.rx.try_iter().collect()
    }

    /// Next update for whichever category is selected when it arrives.
    pub fn recv_selected(&self, timeout: Duration) -> Option<SyncUpdate> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let update = self.rx.recv_timeout(remaining).ok()?;
            let selected = self.inner.upgrade()?.lock_state().selected();
            if update.category == selected {
                return Some(update);
            }
        }
    }
}
