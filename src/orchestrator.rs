//! Stage orchestration with checkpoint/resume.
//!
//! ## Why persist the whole manuscript after every stage?
//!
//! The cache avoids repeated external calls *inside* a stage; the checkpoint
//! avoids re-running whole stages. Resuming needs the exact input of the next
//! stage, and the manuscript is that input. A restart loads the latest stage
//! output and continues with the stage after it.
//!
//! ## State machine
//!
//! ```text
//! NotStarted ─▶ navigation ─▶ extraction ─▶ … ─▶ encoding
//!      ▲                                              │
//!      └──────────────── discard checkpoint ◀─────────┘
//! ```
//!
//! Transitions only move forward by one stage. A fatal error leaves the last
//! checkpoint untouched, so the next run resumes where this one stopped.

use crate::cache::{FsStore, PipelineCache};
use crate::checkpoint::{CheckpointStore, PipelineState, Stage};
use crate::config::PipelineConfig;
use crate::container::Container;
use crate::error::{PipelineError, SegmentError, ServiceError};
use crate::model::Manuscript;
use crate::navigation::NavigationResolver;
use crate::pipeline::render::PageRenderer;
use crate::pipeline::{capture, encode, extract, rewrite, speech, StageContext};
use crate::pool::WorkerPool;
use crate::segment::ContentSegmenter;
use crate::services::Services;
use crate::workspace::{blocking, Workspace};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of one orchestrated run over a scope.
#[derive(Debug)]
pub struct StageRun {
    /// Stage recorded by the checkpoint the run started from.
    pub resumed_from: Option<Stage>,
    /// Stages executed by this run, in order.
    pub completed: Vec<Stage>,
    /// Non-fatal segment failures per executed stage.
    pub failures: BTreeMap<Stage, Vec<SegmentError>>,
    pub manuscript: Manuscript,
}

/// Drives a manuscript through every stage of the pipeline.
pub struct StageOrchestrator<'a> {
    config: &'a PipelineConfig,
    workspace: &'a Workspace,
    services: &'a Services,
    cache: PipelineCache,
    pool: WorkerPool,
}

impl<'a> StageOrchestrator<'a> {
    /// Orchestrator with the filesystem cache and the process-wide pool for
    /// `config.concurrency`.
    pub fn new(config: &'a PipelineConfig, workspace: &'a Workspace, services: &'a Services) -> Self {
        Self {
            config,
            workspace,
            services,
            cache: PipelineCache::new(Arc::new(FsStore::new(workspace.clone())), config.cache_enabled),
            pool: WorkerPool::shared(config.concurrency),
        }
    }

    pub fn with_cache(mut self, cache: PipelineCache) -> Self {
        self.cache = cache;
        self
    }

    /// Share a pool (and its limit) with other orchestrators.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Run `seed`'s scope to completion or to `stop_after`.
    ///
    /// With `config.resume` set and a readable checkpoint present, the
    /// checkpoint's manuscript replaces `seed` and completed stages are
    /// skipped. Otherwise the checkpoint is discarded and `seed` starts at
    /// the first stage.
    pub async fn run(&self, container: &dyn Container, seed: Manuscript) -> Result<StageRun, PipelineError> {
        let scope_id = seed.scope_id.clone();
        let checkpoints = CheckpointStore::new(self.workspace.scope(&scope_id).root());
        let resume = self.config.resume;
        let store = checkpoints.clone();
        let restored = blocking(move || {
            if !resume {
                store.discard()?;
            }
            Ok(store.load())
        })
        .await?;

        let (mut state, mut manuscript) = match restored {
            Some((cp, m)) => {
                info!("Resuming scope {} after stage {}", scope_id, cp.stage);
                (PipelineState::Completed(cp.stage), m)
            }
            None => (PipelineState::NotStarted, seed),
        };
        let resumed_from = state.last_completed();
        let ctx = StageContext::new(self.config, self.workspace, &scope_id, self.cache.clone(), self.pool.clone());

        let mut completed = Vec::new();
        let mut failures = BTreeMap::new();

        for stage in Stage::ALL {
            if resumed_from.is_some_and(|done| stage <= done) {
                debug!("Stage {} covered by checkpoint", stage);
                ctx.progress.on_stage_skipped(stage);
                continue;
            }
            if self.config.stop_after.is_some_and(|last| stage > last) {
                info!("Stopping after stage {}", state);
                break;
            }

            ctx.progress.on_stage_start(stage);
            let start = Instant::now();
            let errors = self.run_stage(stage, container, &mut manuscript, &ctx).await?;
            state = state.advance(stage)?;
            let (store, snapshot) = (checkpoints.clone(), manuscript.clone());
            blocking(move || store.save(stage, &snapshot)).await?;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            info!(
                "Stage {} complete in {}ms ({} segment failures)",
                stage,
                elapsed_ms,
                errors.len()
            );
            ctx.progress.on_stage_complete(stage, elapsed_ms);
            completed.push(stage);
            failures.insert(stage, errors);
        }

        Ok(StageRun {
            resumed_from,
            completed,
            failures,
            manuscript,
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        container: &dyn Container,
        manuscript: &mut Manuscript,
        ctx: &StageContext<'_>,
    ) -> Result<Vec<SegmentError>, PipelineError> {
        match stage {
            Stage::Navigation => {
                let navigation = NavigationResolver::new().resolve(container);
                info!(
                    "Navigation: {} entries from {:?}",
                    navigation.node_count(),
                    navigation.source
                );
                manuscript.navigation = Some(navigation);
                Ok(Vec::new())
            }
            Stage::Extraction => {
                let navigation = match &manuscript.navigation {
                    Some(nav) => nav.clone(),
                    None => NavigationResolver::new().resolve(container),
                };
                let images = extract::export_images(container, &ctx.scope.images())?;
                manuscript.chapters =
                    extract::extract_chapters(container, &navigation, &self.config.selection, &images);
                Ok(Vec::new())
            }
            Stage::Segmentation => {
                let segmenter = ContentSegmenter::new(self.config.max_segment_chars);
                segmenter.segment_chapters(&mut manuscript.chapters);
                info!("Segmentation: {} segments", manuscript.segment_count());
                Ok(Vec::new())
            }
            Stage::Rewriting => {
                if self.config.skip_rewriting {
                    info!("Rewriting skipped, narrating original text");
                    return Ok(Vec::new());
                }
                let rewriter = require(
                    stage,
                    "text rewriter",
                    &self.services.rewriter,
                    "Pass --provider or set OPENAI_API_KEY, or use --skip-rewrite.",
                )?;
                rewriter.check().await.map_err(|e| unavailable(stage, "text rewriter", e))?;
                rewrite::run(manuscript, rewriter, ctx).await
            }
            Stage::Speech => {
                let synthesizer = require(
                    stage,
                    "speech synthesizer",
                    &self.services.synthesizer,
                    "Pass --tts-command '<program> {input} {output}'.",
                )?;
                synthesizer
                    .check()
                    .await
                    .map_err(|e| unavailable(stage, "speech synthesizer", e))?;
                speech::run(manuscript, synthesizer, ctx).await
            }
            Stage::Rendering => {
                let (style, video) = (self.config.style.clone(), self.config.video.clone());
                let (pages_dir, mut owned) = (ctx.scope.pages(), manuscript.clone());
                let (rendered, pages) = blocking(move || {
                    let pages = PageRenderer::new(&style, &video).render_manuscript(&mut owned, &pages_dir)?;
                    Ok((owned, pages))
                })
                .await?;
                *manuscript = rendered;
                info!("Rendering: {} pages", pages);
                Ok(Vec::new())
            }
            Stage::Capture => {
                let capture = require(
                    stage,
                    "page capture engine",
                    &self.services.capture,
                    "Pass --capture-command '<program> {page} {audio} {duration} {output}'.",
                )?;
                capture
                    .check()
                    .await
                    .map_err(|e| unavailable(stage, "page capture engine", e))?;
                capture::run(manuscript, capture, ctx).await
            }
            Stage::Encoding => {
                let encoder = require(stage, "media encoder", &self.services.encoder, "Install ffmpeg.")?;
                encoder
                    .check()
                    .await
                    .map_err(|e| unavailable(stage, "media encoder", e))?;
                encode::run(manuscript, encoder, ctx).await
            }
        }
    }
}

fn require<T: ?Sized>(
    stage: Stage,
    service: &'static str,
    slot: &Option<Arc<T>>,
    hint: &str,
) -> Result<Arc<T>, PipelineError> {
    slot.clone().ok_or_else(|| PipelineError::ServiceNotConfigured {
        stage,
        service,
        hint: hint.to_string(),
    })
}

fn unavailable(stage: Stage, service: &'static str, error: ServiceError) -> PipelineError {
    PipelineError::ServiceUnavailable {
        stage,
        service,
        detail: error.to_string(),
    }
}
