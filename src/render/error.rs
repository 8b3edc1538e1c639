//! Render and decoder errors

use crate::category::Category;

/// Errors from a document decoder
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[cfg(feature = "pdf")]
    #[error("PDF engine: {0}")]
    Pdf(#[from] mupdf::error::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("document has no pages")]
    Empty,

    #[error("decoder out of memory: {detail}")]
    OutOfMemory { detail: String },

    #[error("{detail}")]
    Generic { detail: String },
}

impl DecodeError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }

    /// The decoder could not allocate; the document itself may be fine.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::OutOfMemory { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }
}

/// Errors returned from render calls
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("no cached document for {0}")]
    NoCachedFile(Category),

    #[error("cannot decode cached {category} document: {source}")]
    DecodeFailed {
        category: Category,
        #[source]
        source: DecodeError,
    },

    #[error("bitmap of {width}x{height} exceeds the allocatable size")]
    OutOfMemory { width: u64, height: u64 },

    #[error("invalid render request: {0}")]
    InvalidRequest(String),
}

impl RenderError {
    /// Whether the caller should keep showing its previous frame.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::InvalidRequest(_))
    }
}
