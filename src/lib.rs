//! # edgequake-audiobook
//!
//! Turn EPUB books into narrated videos: every paragraph is rewritten for the
//! ear, spoken, shown on a page with word highlighting, recorded, and joined
//! into chapter videos and one whole-book video.
//!
//! ## Why a resumable pipeline?
//!
//! A book is thousands of paragraphs, and every paragraph costs an LLM call,
//! a TTS call and a browser recording. Any of these fail occasionally, and a
//! full run takes hours. So the crate is built around three guarantees:
//!
//! * an external call is never repeated for input it has already seen
//!   (content-addressed two-tier cache, shared across books);
//! * a stage is never repeated once it has completed (checkpoint after
//!   every stage, resume on restart);
//! * one failed paragraph never costs the book (per-segment default
//!   outcomes, only a missing collaborator stops a stage).
//!
//! ## Pipeline Overview
//!
//! ```text
//! EPUB
//!  │
//!  ├─ 1. Navigation    NCX map → nav document → spine fallback
//!  ├─ 2. Extraction    chapters of text and image units
//!  ├─ 3. Segmentation  sentence-packed segments with stable ids
//!  ├─ 4. Rewriting     LLM narration text (concurrent, cached)
//!  ├─ 5. Speech        TTS audio + word timings (concurrent, cached)
//!  ├─ 6. Rendering     one self-contained HTML page per segment
//!  ├─ 7. Capture       page + audio → clip (sequential, cached)
//!  └─ 8. Encoding      chapter videos + whole-book video (ffmpeg)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_audiobook::{narrate, PipelineConfig, Services};
//! use edgequake_audiobook::services::{CommandCapture, CommandSynthesizer, FfmpegEncoder, LlmRewriter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = Services::new()
//!         .rewriter(Arc::new(LlmRewriter::from_env(None, None)?))
//!         .synthesizer(Arc::new(CommandSynthesizer::new("edge-tts -f {input} --write-media {output}")?))
//!         .capture(Arc::new(CommandCapture::new("record-page {page} {audio} {duration} {output}")?))
//!         .encoder(Arc::new(FfmpegEncoder::new()));
//!
//!     let config = PipelineConfig::builder().data_dir("data").build()?;
//!     let report = narrate("book.epub", &config, &services).await?;
//!     println!("{:?} ({} segment failures)", report.output, report.failure_count());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `audiobook` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod error;
pub mod markup;
pub mod model;
pub mod navigation;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod segment;
pub mod services;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{cache_stats, clean_expired, clean_scope, CacheStats, PipelineCache};
pub use checkpoint::{PipelineState, Stage};
pub use config::{ChapterSelection, PipelineConfig, PipelineConfigBuilder, RenderStyle, VideoSettings};
pub use container::{Container, EpubContainer, MemoryContainer};
pub use error::{PipelineError, SegmentError, ServiceError};
pub use model::{Chapter, Manuscript, Navigation, NavigationNode, Segment};
pub use navigation::NavigationResolver;
pub use orchestrator::StageOrchestrator;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use run::{discard_checkpoint, inspect, inspect_container, narrate, narrate_container, BookOverview, RunReport};
pub use segment::ContentSegmenter;
pub use services::Services;
pub use workspace::Workspace;
