//! Progress-callback trait for stage and segment events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator moves through the stages and works through the
//! segments of each fan-out stage.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a channel, a WebSocket, a database record or a terminal
//! progress bar without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because segment events are raised
//! from worker tasks.
//!
//! # Example
//!
//! ```rust
//! use edgequake_audiobook::{PipelineConfig, PipelineProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     segments: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_segment_complete(&self, stage: Stage, index: usize, total: usize) {
//!         let done = self.segments.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage}: {done}/{total} (segment {index})");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { segments: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::checkpoint::Stage;
use std::sync::Arc;

/// Called by the orchestrator as it runs a book through the pipeline.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_segment_complete` and `on_segment_error` may be called concurrently
/// from different worker tasks during rewriting and speech synthesis.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage is about to run.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// A stage finished and its checkpoint was written.
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// A stage was skipped because a checkpoint already covers it.
    fn on_stage_skipped(&self, stage: Stage) {
        let _ = stage;
    }

    /// One unit of work inside a stage finished.
    ///
    /// # Arguments
    /// * `index`: 0-based position of the segment in reading order
    /// * `total`: number of units the stage processes
    fn on_segment_complete(&self, stage: Stage, index: usize, total: usize) {
        let _ = (stage, index, total);
    }

    /// One unit of work failed and received a default outcome.
    fn on_segment_error(&self, stage: Stage, index: usize, total: usize, error: &str) {
        let _ = (stage, index, total, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
