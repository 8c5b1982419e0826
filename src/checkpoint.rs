//! Stage enumeration, run state machine and checkpoint persistence.
//!
//! ## Why an enum instead of stage-name strings?
//!
//! Resume logic asks "is stage A before stage B?". Comparing names as strings
//! answers a lexical question ("capture" < "encoding" < "extraction") that has
//! nothing to do with pipeline order. [`Stage`] derives `Ord` from declaration
//! order, so the comparison is total, closed and survives renames.
//!
//! ## On-disk layout (inside a scope directory)
//!
//! ```text
//! <scope>/checkpoint.json          {stage, scope_id, timestamp, data_file}
//! <scope>/stages/<stage>.json      full Manuscript after that stage
//! ```
//!
//! The stage data is written before the pointer, both atomically, so a crash
//! between the two writes leaves the previous checkpoint valid.

use crate::error::PipelineError;
use crate::model::Manuscript;
use crate::workspace::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Navigation,
    Extraction,
    Segmentation,
    Rewriting,
    Speech,
    Rendering,
    Capture,
    Encoding,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Navigation,
        Stage::Extraction,
        Stage::Segmentation,
        Stage::Rewriting,
        Stage::Speech,
        Stage::Rendering,
        Stage::Capture,
        Stage::Encoding,
    ];

    pub const FIRST: Stage = Stage::Navigation;

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Navigation => "navigation",
            Stage::Extraction => "extraction",
            Stage::Segmentation => "segmentation",
            Stage::Rewriting => "rewriting",
            Stage::Speech => "speech",
            Stage::Rendering => "rendering",
            Stage::Capture => "capture",
            Stage::Encoding => "encoding",
        }
    }

    /// The stage after this one, `None` for the last.
    pub fn next(self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = Stage::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown stage '{s}', expected one of: {}", names.join(", "))
            })
    }
}

// ── State machine ────────────────────────────────────────────────────────

/// Progress of one scope through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Completed(Stage),
}

impl PipelineState {
    /// The stage that should run next, `None` when the pipeline is finished.
    pub fn next_stage(self) -> Option<Stage> {
        match self {
            PipelineState::NotStarted => Some(Stage::FIRST),
            PipelineState::Completed(stage) => stage.next(),
        }
    }

    /// Record `stage` as completed. Only the immediate next stage is accepted.
    pub fn advance(self, stage: Stage) -> Result<PipelineState, PipelineError> {
        if self.next_stage() == Some(stage) {
            Ok(PipelineState::Completed(stage))
        } else {
            Err(PipelineError::InvalidTransition {
                from: self.to_string(),
                to: stage,
            })
        }
    }

    pub fn last_completed(self) -> Option<Stage> {
        match self {
            PipelineState::NotStarted => None,
            PipelineState::Completed(stage) => Some(stage),
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::NotStarted => f.write_str("not_started"),
            PipelineState::Completed(stage) => write!(f, "{stage}"),
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────────

/// The single checkpoint pointer of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub stage: Stage,
    pub scope_id: String,
    pub timestamp: DateTime<Utc>,
    /// File name of the stage output, relative to the `stages/` directory.
    pub data_file: String,
}

/// Reads and writes checkpoints for one scope directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    scope_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(scope_dir: impl Into<PathBuf>) -> Self {
        Self {
            scope_dir: scope_dir.into(),
        }
    }

    fn pointer_path(&self) -> PathBuf {
        self.scope_dir.join("checkpoint.json")
    }

    fn stages_dir(&self) -> PathBuf {
        self.scope_dir.join("stages")
    }

    pub fn stage_path(&self, stage: Stage) -> PathBuf {
        self.stages_dir().join(format!("{stage}.json"))
    }

    /// Persist `manuscript` as the output of `stage` and move the pointer.
    pub fn save(&self, stage: Stage, manuscript: &Manuscript) -> Result<PipelineCheckpoint, PipelineError> {
        let data_path = self.stage_path(stage);
        write_json_atomic(&data_path, manuscript)?;

        let checkpoint = PipelineCheckpoint {
            stage,
            scope_id: manuscript.scope_id.clone(),
            timestamp: Utc::now(),
            data_file: format!("{stage}.json"),
        };
        write_json_atomic(&self.pointer_path(), &checkpoint)?;
        debug!("Checkpoint saved: scope {} at {}", checkpoint.scope_id, stage);
        Ok(checkpoint)
    }

    /// Load the latest checkpoint and its stage output.
    ///
    /// Anything missing or unreadable is reported as "no checkpoint" so the
    /// run restarts instead of failing.
    pub fn load(&self) -> Option<(PipelineCheckpoint, Manuscript)> {
        let pointer = self.pointer_path();
        let raw = match std::fs::read(&pointer) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Checkpoint {} unreadable, starting over: {}", pointer.display(), e);
                return None;
            }
        };
        let checkpoint: PipelineCheckpoint = match serde_json::from_slice(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!("Checkpoint {} is corrupt, starting over: {}", pointer.display(), e);
                return None;
            }
        };

        let data_path = self.stages_dir().join(&checkpoint.data_file);
        let manuscript = std::fs::read(&data_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_slice::<Manuscript>(&raw).map_err(|e| e.to_string()));
        match manuscript {
            Ok(m) if m.scope_id == checkpoint.scope_id => Some((checkpoint, m)),
            Ok(m) => {
                warn!(
                    "Checkpoint data belongs to scope {} not {}, starting over",
                    m.scope_id, checkpoint.scope_id
                );
                None
            }
            Err(e) => {
                warn!("Stage data {} unreadable, starting over: {}", data_path.display(), e);
                None
            }
        }
    }

    /// Current state derived from the pointer on disk.
    pub fn state(&self) -> PipelineState {
        match self.load() {
            Some((cp, _)) => PipelineState::Completed(cp.stage),
            None => PipelineState::NotStarted,
        }
    }

    /// Reset to `NotStarted`: remove the pointer and every stage output.
    pub fn discard(&self) -> Result<(), PipelineError> {
        remove_if_exists(&self.pointer_path())?;
        let stages = self.stages_dir();
        match std::fs::remove_dir_all(&stages) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::write(stages, e)),
        }
        debug!("Checkpoint discarded in {}", self.scope_dir.display());
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), PipelineError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::write(path, e)),
    }
}
