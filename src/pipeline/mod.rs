//! Pipeline stages for e-book narration.
//!
//! Each submodule implements exactly one transformation step. The
//! orchestrator owns ordering, checkpoints and preconditions; a stage only
//! transforms a [`Manuscript`](crate::model::Manuscript) and reports the
//! segments it could not handle.
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ extract ─▶ rewrite ─▶ speech ─▶ render ─▶ capture ─▶ encode
//! (path)   (units)    (LLM)      (TTS)     (HTML)    (video)    (ffmpeg)
//! ```
//!
//! 1. [`input`]:   canonicalise the user-supplied path or URL to a local file
//! 2. [`extract`]: export images and turn navigation entries into chapters
//! 3. [`rewrite`]: narration text per segment, fanned out over the pool
//! 4. [`speech`]:  audio and word timings per segment, fanned out
//! 5. [`render`]:  one self-contained HTML page per segment
//! 6. [`capture`]: record each page as a clip, sequentially
//! 7. [`encode`]:  join clips into chapter videos and the whole work
//!
//! [`postprocess`] holds the deterministic cleanup applied to rewrites.

pub mod capture;
pub mod encode;
pub mod extract;
pub mod input;
pub mod postprocess;
pub mod render;
pub mod rewrite;
pub mod speech;

use crate::cache::PipelineCache;
use crate::checkpoint::Stage;
use crate::config::PipelineConfig;
use crate::error::SegmentError;
use crate::model::Manuscript;
use crate::pool::{TaskFailure, WorkerPool};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::workspace::{ScopeDirs, Workspace};
use std::sync::Arc;

/// Everything a stage needs besides the manuscript and its collaborator.
#[derive(Clone)]
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub workspace: &'a Workspace,
    pub scope: ScopeDirs,
    pub scope_id: &'a str,
    pub cache: PipelineCache,
    pub pool: WorkerPool,
    pub progress: ProgressCallback,
}

impl<'a> StageContext<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        workspace: &'a Workspace,
        scope_id: &'a str,
        cache: PipelineCache,
        pool: WorkerPool,
    ) -> Self {
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        Self {
            config,
            workspace,
            scope: workspace.scope(scope_id),
            scope_id,
            cache,
            pool,
            progress,
        }
    }

    /// Report one finished unit of work to the progress callback.
    pub(crate) fn report<R>(&self, stage: Stage, index: usize, total: usize, outcome: &Result<R, TaskFailure>) {
        match outcome {
            Ok(_) => self.progress.on_segment_complete(stage, index, total),
            Err(failure) => self
                .progress
                .on_segment_error(stage, index, total, &failure.to_string()),
        }
    }
}

/// Position of a segment: `(chapter index, segment index)`.
pub(crate) type SegmentPos = (usize, usize);

/// Every segment position in reading order.
pub(crate) fn positions(manuscript: &Manuscript) -> Vec<SegmentPos> {
    manuscript
        .chapters
        .iter()
        .enumerate()
        .flat_map(|(ci, chapter)| (0..chapter.segments.len()).map(move |si| (ci, si)))
        .collect()
}

/// Map a pool outcome onto the segment error taxonomy.
pub(crate) fn segment_error(stage: Stage, segment: &str, failure: TaskFailure) -> SegmentError {
    let segment = segment.to_string();
    match failure {
        TaskFailure::Failed(detail) => SegmentError::ServiceFailed { segment, stage, detail },
        TaskFailure::TimedOut { secs } => SegmentError::Timeout { segment, stage, secs },
        TaskFailure::Aborted(detail) => SegmentError::TaskAborted { segment, stage, detail },
    }
}
