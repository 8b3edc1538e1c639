//! Error taxonomy for the synchronization side

use crate::category::Category;

use super::types::FailReason;

/// Failures of the key/value config service itself.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config service unreachable: {0}")]
    Unreachable(String),

    #[error("config payload rejected: {0}")]
    Malformed(String),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures while starting or running a download.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("a download for {0} is already in progress")]
    AlreadyActive(Category),

    #[error("cannot derive a file name from '{0}'")]
    InvalidUrl(String),

    #[error("transfer engine: {detail}")]
    Engine { detail: String },

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine { detail: msg.into() }
    }
}

/// Errors surfaced by a refresh attempt.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no document URL available for {category}: {detail}")]
    ConfigUnavailable { category: Category, detail: String },

    #[error("network is not reachable")]
    NoNetwork,

    #[error("download failed: {0}")]
    TransferFailed(#[from] TransferError),

    #[error("cache I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// The user-facing failure this error folds into.
    #[must_use]
    pub fn fail_reason(&self) -> FailReason {
        match self {
            SyncError::NoNetwork => FailReason::NoNetwork,
            SyncError::ConfigUnavailable { .. }
            | SyncError::TransferFailed(_)
            | SyncError::Io(_) => FailReason::TransferFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reachability_maps_to_no_network() {
        assert_eq!(SyncError::NoNetwork.fail_reason(), FailReason::NoNetwork);
        let unavailable = SyncError::ConfigUnavailable {
            category: Category::Primary,
            detail: "blank".into(),
        };
        assert_eq!(unavailable.fail_reason(), FailReason::TransferFailed);
        let transfer = SyncError::from(TransferError::engine("boom"));
        assert_eq!(transfer.fail_reason(), FailReason::TransferFailed);
    }
}
