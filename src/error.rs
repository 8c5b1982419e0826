//! Error types for the edgequake-audiobook library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] is **fatal**: the run cannot proceed at all (the book
//!   cannot be opened, a stage has no collaborator configured, output cannot
//!   be written). Returned as `Err(PipelineError)` from the top-level entry
//!   points. The last good checkpoint is always left on disk.
//!
//! * [`SegmentError`] is **non-fatal**: one segment failed inside a stage
//!   (transient API error, timeout, crashed subprocess). The orchestrator
//!   substitutes a default outcome for that segment, logs the error and keeps
//!   going, so one bad paragraph never costs the whole book.
//!
//! Collaborator adapters report through [`ServiceError`], cache backends
//! through [`CacheError`] and container readers through [`ContainerError`];
//! the orchestrator decides which of the two buckets above they fall into.

use crate::checkpoint::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-audiobook library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Book not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a ZIP-based EPUB container.
    #[error("File is not a valid EPUB: '{path}'\nFirst bytes: {magic:?}")]
    NotAnEpub { path: PathBuf, magic: [u8; 4] },

    /// The container could not be opened or parsed.
    #[error(transparent)]
    Container(#[from] ContainerError),

    // ── Stage preconditions ───────────────────────────────────────────────
    /// A stage needs a collaborator and none was configured.
    #[error("Stage '{stage}' needs a {service} but none is configured.\n{hint}")]
    ServiceNotConfigured {
        stage: Stage,
        service: &'static str,
        hint: String,
    },

    /// The collaborator exists but its readiness probe failed.
    #[error("Stage '{stage}': {service} is not usable: {detail}")]
    ServiceUnavailable {
        stage: Stage,
        service: &'static str,
        detail: String,
    },

    /// Encoding found no segment or chapter video to assemble.
    #[error("Nothing to encode: no chapter produced a video")]
    NothingToEncode,

    // ── State machine ─────────────────────────────────────────────────────
    /// A stage was recorded out of pipeline order.
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidTransition { from: String, to: Stage },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a checkpoint, stage record or artefact.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::OutputWriteFailed {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single segment.
///
/// Logged and reported through the progress callback; the segment receives a
/// default outcome (original text, silent placeholder, no video).
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum SegmentError {
    /// The external collaborator returned an error.
    #[error("Segment {segment}: {stage} failed: {detail}")]
    ServiceFailed {
        segment: String,
        stage: Stage,
        detail: String,
    },

    /// The call did not finish within the stage timeout.
    #[error("Segment {segment}: {stage} timed out after {secs}s")]
    Timeout {
        segment: String,
        stage: Stage,
        secs: u64,
    },

    /// The worker task panicked or was cancelled.
    #[error("Segment {segment}: {stage} task aborted: {detail}")]
    TaskAborted {
        segment: String,
        stage: Stage,
        detail: String,
    },
}

/// Errors reported by external collaborators (rewriter, synthesiser,
/// capture engine, encoder).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service cannot be reached or is not installed.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The service ran past its deadline.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Local I/O around the call failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a cache storage backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry '{key}' is unreadable: {detail}")]
    Corrupt { key: String, detail: String },
}

/// Errors from a book container reader.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to open book '{path}': {detail}")]
    Open { path: PathBuf, detail: String },

    #[error("Resource '{0}' is not present in the book")]
    MissingResource(String),
}
