//! Keeping the cached timetable documents up to date

mod cache;
mod config;
mod error;
mod http;
mod machine;
mod network;
mod remote_config;
mod state;
mod transfer;
mod types;

pub use cache::{DocumentCache, PARTIAL_SUFFIX};
pub use config::{ConfigResolver, KeyValueConfig, StaticConfig};
pub use error::{ConfigError, SyncError, TransferError};
pub use http::HttpTransferEngine;
pub use machine::{CategoryStatus, Subscription, SyncParts, SyncStateMachine};
pub use network::{DEFAULT_PROBE, Reachability, TcpProbe};
pub use remote_config::{DEFAULT_MIN_FETCH_INTERVAL, RemoteConfig};
pub use state::{Command, Effect, Phase, SyncState};
pub use transfer::{
    BackgroundPolicy, NetworkPolicy, TransferCoordinator, TransferEngine, TransferEvent,
    TransferHandle, TransferListener, TransferPriority, TransferRequest, TransferStream,
};
pub use types::{
    CachedFile, DownloadSession, FailReason, RemoteDocumentRef, SessionId, SessionState,
    SyncResult, SyncUpdate,
};
