//! Error types for the thumbnail engine.
//!
//! Per-item failures carry enough context to log once at the point of
//! handling; callers match on the variant to decide between "file is bad"
//! (decode exhausted) and "try again later" (cancelled or timed out).

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThumbError>;

#[derive(Debug, Error)]
pub enum ThumbError {
    /// Source file vanished between indexing and generation.
    #[error("source not found: {0}")]
    NotFound(PathBuf),

    /// Every backend in the decode fallback chain failed.
    #[error("all decode attempts failed for {path}: {detail}")]
    DecodeExhausted { path: PathBuf, detail: String },

    /// Work was abandoned at a cancellation checkpoint.
    #[error("cancelled during {0}")]
    Cancelled(&'static str),

    /// An external tool ran past its deadline.
    #[error("{tool} timed out after {secs}s on {path}")]
    ToolTimeout {
        tool: &'static str,
        secs: u64,
        path: PathBuf,
    },

    /// Encoding a decoded buffer failed; usually means the buffer is corrupt.
    #[error("encode failed for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },

    /// The media index collaborator failed a query.
    #[error("index query failed: {0}")]
    Index(#[from] IndexError),

    /// The native decode backend was asked to start after its terminal
    /// shutdown.
    #[error("native decode backend already shut down")]
    BackendShutDown,

    /// The native decode backend failed to come up.
    #[error("native decode backend init failed: {0}")]
    BackendInit(String),

    /// The item's media kind has no thumbnail pipeline.
    #[error("no thumbnail pipeline for {0}")]
    Unsupported(PathBuf),
}

impl ThumbError {
    /// True for errors that mean "stopped", not "failed": the item may well
    /// succeed on a later run.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ThumbError::Cancelled(_) | ThumbError::ToolTimeout { .. }
        )
    }
}

/// Error reported by a [`MediaIndex`](crate::media::MediaIndex)
/// implementation. Kept opaque so collaborator crates can map their own
/// error types into it without the engine depending on them.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct IndexError(String);

impl IndexError {
    pub fn new(msg: impl Into<String>) -> Self {
        IndexError(msg.into())
    }
}
