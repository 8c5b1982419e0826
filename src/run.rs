//! Library entry points.
//!
//! ## Why look the book up in an index first?
//!
//! Scope ids are random, so a second run over the same book would otherwise
//! start a fresh scope and redo every stage. The book index maps the stable
//! document identifier (canonical path or URL) to the scope created the first
//! time, and that scope's checkpoint is what a restart resumes from.

use crate::cache::{BookIndex, IndexEntry};
use crate::checkpoint::{CheckpointStore, Stage};
use crate::config::PipelineConfig;
use crate::container::{Container, EpubContainer};
use crate::error::{PipelineError, SegmentError};
use crate::model::{FlatNavigationEntry, Manuscript, Navigation};
use crate::navigation::NavigationResolver;
use crate::orchestrator::StageOrchestrator;
use crate::pipeline::input;
use crate::services::Services;
use crate::workspace::{blocking, new_scope_id, Workspace};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

/// Serialises read-modify-write of the book index between concurrent runs.
static INDEX_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Result of [`narrate`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scope_id: String,
    /// Stage recorded by the checkpoint this run resumed from.
    pub resumed_from: Option<Stage>,
    /// Stages executed by this run.
    pub completed: Vec<Stage>,
    /// Number of segment failures per executed stage.
    pub failures: BTreeMap<Stage, usize>,
    /// Every segment failure, in stage order.
    pub errors: Vec<SegmentError>,
    /// Whole-work video, once encoding has run.
    pub output: Option<PathBuf>,
    pub chapter_videos: Vec<PathBuf>,
    pub duration_ms: u64,
    #[serde(skip)]
    pub manuscript: Manuscript,
}

impl RunReport {
    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }
}

/// Structure of a book, without running anything.
#[derive(Debug, Clone, Serialize)]
pub struct BookOverview {
    pub title: Option<String>,
    pub author: Option<String>,
    pub navigation: Navigation,
    pub entries: Vec<FlatNavigationEntry>,
}

/// Narrate an EPUB file or URL, resuming a previous run when possible.
///
/// # Errors
/// Returns `Err(PipelineError)` only for fatal errors: the book cannot be
/// opened, a stage has no usable collaborator, nothing could be encoded, or
/// output cannot be written. Segment failures are reported in the
/// [`RunReport`].
pub async fn narrate(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
    services: &Services,
) -> Result<RunReport, PipelineError> {
    let input_str = input_str.as_ref();
    info!("Starting narration: {}", input_str);
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let container = open_epub(resolved.path().to_path_buf()).await?;
    narrate_container(resolved.document_id(), &container, config, services).await
}

/// Narrate an already opened container identified by `document_id`.
pub async fn narrate_container(
    document_id: &str,
    container: &dyn Container,
    config: &PipelineConfig,
    services: &Services,
) -> Result<RunReport, PipelineError> {
    let start = Instant::now();
    let workspace = Workspace::new(config.data_dir.clone(), config.output_dir.clone());
    let metadata = container.metadata();
    let title = metadata
        .title
        .clone()
        .unwrap_or_else(|| "untitled".to_string());

    let scope_id = blocking({
        let (index_path, document_id, title) = (workspace.index_path(), document_id.to_string(), title.clone());
        let workspace = workspace.clone();
        move || {
            let _guard = INDEX_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut index = BookIndex::load(index_path);
            let scope_id = match index.get(&document_id) {
                Some(entry) => {
                    info!("Known book, reusing scope {}", entry.scope_id);
                    entry.scope_id.clone()
                }
                None => new_scope_id(),
            };
            index.insert(
                &document_id,
                IndexEntry {
                    scope_id: scope_id.clone(),
                    title,
                    last_accessed: Utc::now(),
                    scope_dir: workspace.scope(&scope_id).root().to_path_buf(),
                },
            );
            index.save()?;
            Ok(scope_id)
        }
    })
    .await?;

    let seed = Manuscript {
        scope_id: scope_id.clone(),
        source: document_id.to_string(),
        title,
        author: metadata.author,
        navigation: None,
        chapters: Vec::new(),
        output: None,
    };

    let run = StageOrchestrator::new(config, &workspace, services)
        .run(container, seed)
        .await?;

    let failures = run.failures.iter().map(|(stage, e)| (*stage, e.len())).collect();
    let errors: Vec<SegmentError> = run.failures.into_values().flatten().collect();
    let (output, chapter_videos) = match &run.manuscript.output {
        Some(out) => (Some(out.path.clone()), out.chapter_videos.clone()),
        None => (None, Vec::new()),
    };
    let duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Narration of scope {} finished: {} stages run, {} segment failures, {}ms",
        scope_id,
        run.completed.len(),
        errors.len(),
        duration_ms
    );

    Ok(RunReport {
        scope_id,
        resumed_from: run.resumed_from,
        completed: run.completed,
        failures,
        errors,
        output,
        chapter_videos,
        duration_ms,
        manuscript: run.manuscript,
    })
}

/// Metadata and navigation of a book.
///
/// Does not require any collaborator or data directory.
pub async fn inspect(input_str: impl AsRef<str>) -> Result<BookOverview, PipelineError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    let container = open_epub(resolved.path().to_path_buf()).await?;
    Ok(inspect_container(&container))
}

/// [`inspect`] for an already opened container.
pub fn inspect_container(container: &dyn Container) -> BookOverview {
    let metadata = container.metadata();
    let navigation = NavigationResolver::new().resolve(container);
    let entries = navigation.flatten();
    BookOverview {
        title: metadata.title,
        author: metadata.author,
        navigation,
        entries,
    }
}

/// Reset the book's scope to `NotStarted`. Returns `false` for a book that
/// was never narrated with this data directory.
pub fn discard_checkpoint(input_str: impl AsRef<str>, config: &PipelineConfig) -> Result<bool, PipelineError> {
    let workspace = Workspace::new(config.data_dir.clone(), config.output_dir.clone());
    let index = BookIndex::load(workspace.index_path());
    let document_id = input::document_id(input_str.as_ref());
    match index.get(&document_id) {
        Some(entry) => {
            CheckpointStore::new(workspace.scope(&entry.scope_id).root()).discard()?;
            info!("Checkpoint of scope {} discarded", entry.scope_id);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Open an EPUB off the async runtime; archive parsing is blocking I/O.
async fn open_epub(path: PathBuf) -> Result<EpubContainer, PipelineError> {
    tokio::task::spawn_blocking(move || EpubContainer::open(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("EPUB reader task failed: {e}")))?
        .map_err(PipelineError::from)
}
