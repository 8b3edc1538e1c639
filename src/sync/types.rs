//! Core types for timetable synchronization

use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

use crate::category::Category;

/// Location of the current remote document for a category.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteDocumentRef {
    pub category: Category,
    pub url: String,
}

impl RemoteDocumentRef {
    pub fn new(category: Category, url: impl Into<String>) -> Self {
        Self {
            category,
            url: url.into(),
        }
    }

    /// Final path segment of the URL, used as the cached filename.
    ///
    /// Query strings and fragments are not part of the identity.
    /// Returns `None` when the URL has no usable final segment.
    #[must_use]
    pub fn identity_key(&self) -> Option<String> {
        identity_key(&self.url)
    }
}

pub(crate) fn identity_key(url: &str) -> Option<String> {
    let without_fragment = url.trim().split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let segment = without_query.rsplit('/').next()?.trim();

    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return None;
    }
    Some(segment.to_string())
}

/// A downloaded document present in the local cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFile {
    pub category: Category,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub identity_key: String,
    pub modified: SystemTime,
}

/// Why a refresh ended in failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    NoNetwork,
    TransferFailed,
}

/// Result model observed by the presentation layer, one current value per category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncResult {
    Loading { indeterminate: bool, progress: u8 },
    Success,
    Fail { reason: FailReason },
}

impl SyncResult {
    #[must_use]
    pub const fn loading(progress: u8) -> Self {
        Self::Loading {
            indeterminate: false,
            progress,
        }
    }

    #[must_use]
    pub const fn indeterminate() -> Self {
        Self::Loading {
            indeterminate: true,
            progress: 0,
        }
    }

    #[must_use]
    pub const fn fail(reason: FailReason) -> Self {
        Self::Fail { reason }
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_loading()
    }
}

/// Identifier of one refresh attempt for a category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

/// A result tagged with where it came from, so stale deliveries can be dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SyncUpdate {
    pub category: Category,
    pub session: SessionId,
    pub result: SyncResult,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Snapshot of a single in-flight download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownloadSession {
    pub category: Category,
    pub session: SessionId,
    pub url: String,
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub state: SessionState,
}

impl DownloadSession {
    /// Completion percentage, 0 when the total size is not known yet.
    #[must_use]
    pub fn percent(&self) -> u8 {
        percent(self.bytes_done, self.bytes_total)
    }
}

pub(crate) fn percent(done: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => ((done.min(total) as u128 * 100) / total as u128) as u8,
        _ => 0,
    }
}
