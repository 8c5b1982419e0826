//! Configuration types for an e-book narration run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share the config with every stage and worker task, and to log
//! exactly what a run was asked to do.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use crate::checkpoint::Stage;
use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a narration run.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_audiobook::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .data_dir("/tmp/audiobooks")
///     .max_segment_chars(400)
///     .concurrency(4)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of caches, checkpoints and scope artefacts. Default: `./data`.
    pub data_dir: PathBuf,

    /// Where final media is written. Default: `<data_dir>/outputs`.
    pub output_dir: Option<PathBuf>,

    /// Character budget per segment. Default: 500.
    ///
    /// Roughly 30–40 seconds of narration: long enough for natural prosody,
    /// short enough that one failed synthesis costs little and one rendered
    /// page fits on screen.
    pub max_segment_chars: usize,

    /// Number of concurrent external calls per fan-out stage. Default: 10.
    ///
    /// Rewriting and synthesis are network-bound. Lower this if a provider
    /// answers with `429`.
    pub concurrency: usize,

    /// Consult and fill the two-tier cache. Default: true.
    pub cache_enabled: bool,

    /// Scopes not touched for this many days are removed by
    /// [`crate::clean_expired`]. Default: 30.
    pub cache_max_age_days: u32,

    /// Per-call timeout for one rewrite. Default: 60 s.
    pub rewrite_timeout_secs: u64,

    /// Per-call timeout for one synthesis. Default: 120 s.
    pub speech_timeout_secs: u64,

    /// Per-call timeout for one page capture. Default: 600 s.
    pub capture_timeout_secs: u64,

    /// Per-call timeout for one encoder invocation. Default: 1800 s.
    pub encode_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Chapters to narrate. Default: all.
    pub selection: ChapterSelection,

    /// Pass text through unchanged instead of calling the rewriter. Default: false.
    pub skip_rewriting: bool,

    /// Resume from the last checkpoint if one exists. Default: true.
    pub resume: bool,

    /// Stop once this stage has completed. Default: run to the end.
    pub stop_after: Option<Stage>,

    /// Optional background music mixed into the final video.
    pub background_audio: Option<PathBuf>,

    /// How long an illustration stays on screen. Default: 5 s.
    pub image_display_secs: f64,

    /// Silence substituted for a failed synthesis. Default: 1 s.
    pub silence_fallback_secs: f64,

    /// Container extension for synthesised audio. Default: `mp3`.
    pub audio_format: String,

    /// Output video geometry and container.
    pub video: VideoSettings,

    /// Typography of rendered pages.
    pub style: RenderStyle,

    /// Receives stage and segment events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: None,
            max_segment_chars: 500,
            concurrency: 10,
            cache_enabled: true,
            cache_max_age_days: 30,
            rewrite_timeout_secs: 60,
            speech_timeout_secs: 120,
            capture_timeout_secs: 600,
            encode_timeout_secs: 1800,
            download_timeout_secs: 120,
            selection: ChapterSelection::default(),
            skip_rewriting: false,
            resume: true,
            stop_after: None,
            background_audio: None,
            image_display_secs: 5.0,
            silence_fallback_secs: 1.0,
            audio_format: "mp3".to_string(),
            video: VideoSettings::default(),
            style: RenderStyle::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("data_dir", &self.data_dir)
            .field("output_dir", &self.output_dir)
            .field("max_segment_chars", &self.max_segment_chars)
            .field("concurrency", &self.concurrency)
            .field("cache_enabled", &self.cache_enabled)
            .field("selection", &self.selection)
            .field("skip_rewriting", &self.skip_rewriting)
            .field("resume", &self.resume)
            .field("stop_after", &self.stop_after)
            .field("video", &self.video)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn timeout(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Rewriting => self.rewrite_timeout_secs,
            Stage::Speech => self.speech_timeout_secs,
            Stage::Capture => self.capture_timeout_secs,
            Stage::Encoding => self.encode_timeout_secs,
            _ => self.download_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    pub fn max_segment_chars(mut self, n: usize) -> Self {
        self.config.max_segment_chars = n.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn cache_enabled(mut self, v: bool) -> Self {
        self.config.cache_enabled = v;
        self
    }

    pub fn cache_max_age_days(mut self, days: u32) -> Self {
        self.config.cache_max_age_days = days;
        self
    }

    pub fn rewrite_timeout_secs(mut self, secs: u64) -> Self {
        self.config.rewrite_timeout_secs = secs.max(1);
        self
    }

    pub fn speech_timeout_secs(mut self, secs: u64) -> Self {
        self.config.speech_timeout_secs = secs.max(1);
        self
    }

    pub fn capture_timeout_secs(mut self, secs: u64) -> Self {
        self.config.capture_timeout_secs = secs.max(1);
        self
    }

    pub fn encode_timeout_secs(mut self, secs: u64) -> Self {
        self.config.encode_timeout_secs = secs.max(1);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn selection(mut self, selection: ChapterSelection) -> Self {
        self.config.selection = selection;
        self
    }

    pub fn skip_rewriting(mut self, v: bool) -> Self {
        self.config.skip_rewriting = v;
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn stop_after(mut self, stage: Stage) -> Self {
        self.config.stop_after = Some(stage);
        self
    }

    pub fn background_audio(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.background_audio = Some(path.into());
        self
    }

    pub fn image_display_secs(mut self, secs: f64) -> Self {
        self.config.image_display_secs = secs.max(0.1);
        self
    }

    pub fn silence_fallback_secs(mut self, secs: f64) -> Self {
        self.config.silence_fallback_secs = secs.max(0.1);
        self
    }

    pub fn audio_format(mut self, ext: impl Into<String>) -> Self {
        self.config.audio_format = ext.into();
        self
    }

    pub fn video(mut self, video: VideoSettings) -> Self {
        self.config.video = video;
        self
    }

    pub fn style(mut self, style: RenderStyle) -> Self {
        self.config.style = style;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.max_segment_chars == 0 {
            return Err(PipelineError::InvalidConfig(
                "Segment budget must be ≥ 1 character".into(),
            ));
        }
        if c.video.width == 0 || c.video.height == 0 || c.video.fps == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Video geometry must be non-zero, got {}x{} @ {} fps",
                c.video.width, c.video.height, c.video.fps
            )));
        }
        if c.audio_format.trim().is_empty() || c.video.format.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Audio and video formats must be set".into(),
            ));
        }
        if let ChapterSelection::Ids(ids) = &c.selection {
            if ids.is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "Chapter selection names no chapters".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums and settings ───────────────────────────────────────────────────

/// Which chapters of the book to narrate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChapterSelection {
    /// Every chapter (default).
    #[default]
    All,
    /// Only the navigation entries with these ids. Reading order is kept
    /// regardless of the order given here.
    Ids(Vec<String>),
}

impl ChapterSelection {
    pub fn includes(&self, id: &str) -> bool {
        match self {
            ChapterSelection::All => true,
            ChapterSelection::Ids(ids) => ids.iter().any(|i| i == id),
        }
    }

    /// `true` when `id` was named explicitly.
    pub fn names(&self, id: &str) -> bool {
        matches!(self, ChapterSelection::Ids(ids) if ids.iter().any(|i| i == id))
    }

    /// Parse a comma-separated id list; empty input selects everything.
    pub fn parse_list(list: &str) -> Self {
        let ids: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            ChapterSelection::All
        } else {
            ChapterSelection::Ids(ids)
        }
    }
}

/// Geometry and container of produced video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Container extension. Default: `mp4`.
    pub format: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            format: "mp4".to_string(),
        }
    }
}

/// Typography of rendered pages, as CSS values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderStyle {
    pub font_family: String,
    pub font_size: String,
    pub line_height: String,
    pub background_color: String,
    pub text_color: String,
    pub highlight_color: String,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            font_family: "'Noto Serif SC', serif".to_string(),
            font_size: "18px".to_string(),
            line_height: "1.7".to_string(),
            background_color: "#F5F5DC".to_string(),
            text_color: "#333333".to_string(),
            highlight_color: "#FFFF00".to_string(),
        }
    }
}
