//! Single-flight download coordination on top of a callback-based transfer engine

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::error::TransferError;
use super::types::{
    DownloadSession, FailReason, RemoteDocumentRef, SessionId, SessionState, SyncResult,
    SyncUpdate, percent,
};
use crate::category::Category;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransferPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NetworkPolicy {
    #[default]
    Any,
    Unmetered,
}

/// A single download handed to the transfer engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub priority: TransferPriority,
    pub network_policy: NetworkPolicy,
}

/// Engine-assigned identifier of an enqueued transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

/// Callback events emitted by a transfer engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Queued,
    Progress { done: u64, total: Option<u64> },
    Completed,
    Error(String),
    Cancelled,
    /// The transfer was torn down on purpose; no result is reported.
    Removed,
}

pub type TransferListener = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// The byte-moving capability this crate delegates to.
///
/// `enqueue` registers `listener` for the new transfer; events may be delivered
/// from any thread, including synchronously from inside `enqueue`.
pub trait TransferEngine: Send + Sync {
    fn enqueue(
        &self,
        request: TransferRequest,
        listener: TransferListener,
    ) -> Result<TransferHandle, TransferError>;

    /// Unregister the listener of `handle`. The transfer itself keeps running.
    fn detach(&self, handle: TransferHandle);

    /// Stop the transfer and discard partial data.
    fn abort(&self, handle: TransferHandle);
}

/// What happens to a download whose consumer went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundPolicy {
    /// Let it finish so the cache is warm next time.
    #[default]
    Complete,
    /// Abort it immediately.
    Abort,
}

struct Slot {
    session: DownloadSession,
    handle: Option<TransferHandle>,
    consumer: Option<Sender<SyncUpdate>>,
    last_progress: u8,
}

impl Slot {
    fn emit(&mut self, result: SyncResult) {
        let update = SyncUpdate {
            category: self.session.category,
            session: self.session.session,
            result,
        };
        if let Some(tx) = &self.consumer {
            if tx.send(update).is_err() {
                self.consumer = None;
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    slots: Mutex<HashMap<Category, Slot>>,
}

impl Shared {
    fn on_event(&self, category: Category, session: SessionId, event: TransferEvent) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(&category) else {
            return;
        };
        if slot.session.session != session {
            debug!("Dropping {event:?} from superseded {category} session {session:?}");
            return;
        }

        match event {
            TransferEvent::Queued => {
                slot.session.state = SessionState::Queued;
                let progress = slot.last_progress;
                slot.emit(SyncResult::loading(progress));
            }
            TransferEvent::Progress { done, total } => {
                slot.session.state = SessionState::InProgress;
                slot.session.bytes_done = done;
                slot.session.bytes_total = total;
                // Engines may report a smaller count after a retry; keep it monotone.
                let progress = percent(done, total).max(slot.last_progress);
                slot.last_progress = progress;
                slot.emit(SyncResult::loading(progress));
            }
            TransferEvent::Completed => {
                slot.session.state = SessionState::Completed;
                info!("Download for {category} completed");
                slot.emit(SyncResult::Success);
                slots.remove(&category);
            }
            TransferEvent::Error(detail) => {
                slot.session.state = SessionState::Failed;
                warn!("Download for {category} failed: {detail}");
                slot.emit(SyncResult::fail(FailReason::TransferFailed));
                slots.remove(&category);
            }
            TransferEvent::Cancelled => {
                slot.session.state = SessionState::Cancelled;
                info!("Download for {category} cancelled");
                slot.emit(SyncResult::fail(FailReason::TransferFailed));
                slots.remove(&category);
            }
            TransferEvent::Removed => {
                debug!("Download for {category} removed");
                slots.remove(&category);
            }
        }
    }
}

/// Drives at most one download per category through a [`TransferEngine`].
pub struct TransferCoordinator {
    engine: Arc<dyn TransferEngine>,
    policy: BackgroundPolicy,
    shared: Arc<Shared>,
    next_session: AtomicU64,
}

impl TransferCoordinator {
    pub fn new(engine: Arc<dyn TransferEngine>, policy: BackgroundPolicy) -> Self {
        Self {
            engine,
            policy,
            shared: Arc::new(Shared::default()),
            next_session: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn policy(&self) -> BackgroundPolicy {
        self.policy
    }

    /// Start downloading `doc` to `destination`.
    ///
    /// Fails with [`TransferError::AlreadyActive`] while another consumer is
    /// attached to this category's download. A download left running in the
    /// background for the same URL is re-attached instead of restarted; one
    /// for a different URL is aborted first.
    pub fn start(
        &self,
        doc: &RemoteDocumentRef,
        destination: PathBuf,
    ) -> Result<TransferStream, TransferError> {
        let category = doc.category;
        let (tx, rx) = flume::unbounded();
        let mut superseded = None;

        let session = {
            let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let existing = slots
                .get(&category)
                .map(|slot| (slot.consumer.is_some(), slot.session.url == doc.url));

            match existing {
                Some((true, _)) => return Err(TransferError::AlreadyActive(category)),
                Some((false, true)) => {
                    if let Some(slot) = slots.get_mut(&category) {
                        info!("Re-attaching to background download for {category}");
                        slot.consumer = Some(tx);
                        let progress = slot.last_progress;
                        slot.emit(SyncResult::loading(progress));
                        return Ok(self.stream(category, slot.session.session, rx));
                    }
                }
                Some((false, false)) => {
                    superseded = slots.remove(&category).and_then(|slot| slot.handle);
                }
                None => {}
            }

            let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
            slots.insert(
                category,
                Slot {
                    session: DownloadSession {
                        category,
                        session,
                        url: doc.url.clone(),
                        bytes_total: None,
                        bytes_done: 0,
                        state: SessionState::Queued,
                    },
                    handle: None,
                    consumer: Some(tx),
                    last_progress: 0,
                },
            );
            session
        };

        if let Some(handle) = superseded {
            debug!("Aborting superseded background download for {category}");
            self.engine.detach(handle);
            self.engine.abort(handle);
        }

        let shared = Arc::clone(&self.shared);
        let listener: TransferListener =
            Arc::new(move |event| shared.on_event(category, session, event));

        let request = TransferRequest {
            url: doc.url.clone(),
            destination,
            priority: TransferPriority::High,
            network_policy: NetworkPolicy::Any,
        };

        match self.engine.enqueue(request, listener) {
            Ok(handle) => {
                let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(slot) = slots.get_mut(&category) {
                    if slot.session.session == session {
                        slot.handle = Some(handle);
                    }
                }
                debug!("Enqueued {category} download as {handle:?}");
                Ok(self.stream(category, session, rx))
            }
            Err(e) => {
                let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if slots
                    .get(&category)
                    .is_some_and(|slot| slot.session.session == session)
                {
                    slots.remove(&category);
                }
                Err(e)
            }
        }
    }

    fn stream(&self, category: Category, session: SessionId, rx: Receiver<SyncUpdate>) -> TransferStream {
        TransferStream {
            rx,
            category,
            session,
            shared: Arc::clone(&self.shared),
            engine: Arc::clone(&self.engine),
            policy: self.policy,
        }
    }

    /// Snapshot of the category's download, attached or running in the background.
    #[must_use]
    pub fn active_session(&self, category: Category) -> Option<DownloadSession> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .map(|slot| slot.session.clone())
    }

    #[must_use]
    pub fn is_active(&self, category: Category) -> bool {
        self.active_session(category).is_some()
    }

    /// Release every listener registration; running transfers follow the policy.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .filter_map(|(_, slot)| slot.handle)
            .collect();

        for handle in drained {
            self.engine.detach(handle);
            if self.policy == BackgroundPolicy::Abort {
                self.engine.abort(handle);
            }
        }
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pull-style view of one download's results.
///
/// Ends after `Success`/`Fail`, or without a terminal item when the transfer
/// was removed. Dropping the stream detaches it from the download.
pub struct TransferStream {
    rx: Receiver<SyncUpdate>,
    category: Category,
    session: SessionId,
    shared: Arc<Shared>,
    engine: Arc<dyn TransferEngine>,
    policy: BackgroundPolicy,
}

impl TransferStream {
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Block for the next update; `None` once the stream has ended.
    pub fn recv(&self) -> Option<SyncUpdate> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SyncUpdate, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Detach from the download explicitly.
    pub fn cancel(self) {}
}

impl Iterator for TransferStream {
    type Item = SyncUpdate;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        let handle = {
            let mut slots = self.shared.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(slot) = slots.get_mut(&self.category) else {
                return;
            };
            if slot.session.session != self.session {
                return;
            }
            slot.consumer = None;

            match self.policy {
                BackgroundPolicy::Complete => {
                    debug!("{} download continues in the background", self.category);
                    return;
                }
                BackgroundPolicy::Abort => {
                    slot.session.state = SessionState::Cancelled;
                    slots.remove(&self.category).and_then(|slot| slot.handle)
                }
            }
        };

        if let Some(handle) = handle {
            info!("Aborting {} download", self.category);
            self.engine.detach(handle);
            self.engine.abort(handle);
        }
    }
}
