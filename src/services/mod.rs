//! External collaborators, seen only through their I/O contract.
//!
//! Each trait is the boundary to one expensive, fallible service. The
//! orchestrator wraps every call in a timeout and turns failures into a
//! default outcome for the segment; a failed [`check`](TextRewriter::check)
//! is the only way a collaborator can stop a whole stage.
//!
//! Adapters shipped with the crate:
//!
//! | Trait | Adapter | Backed by |
//! |---|---|---|
//! | [`TextRewriter`] | [`LlmRewriter`] | `edgequake-llm` provider |
//! | [`SpeechSynthesizer`] | [`CommandSynthesizer`] | any TTS program |
//! | [`PageCapture`] | [`CommandCapture`] | any headless-browser recorder |
//! | [`MediaEncoder`] | [`FfmpegEncoder`] | `ffmpeg` |

mod command;
mod ffmpeg;
mod llm;

pub use command::{CommandCapture, CommandSynthesizer};
pub use ffmpeg::FfmpegEncoder;
pub use llm::LlmRewriter;

use crate::config::VideoSettings;
use crate::error::ServiceError;
use crate::model::WordTiming;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Rewrites written prose into narration.
#[async_trait]
pub trait TextRewriter: Send + Sync {
    /// Readiness probe run once before the stage.
    async fn check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn rewrite(&self, text: &str) -> Result<String, ServiceError>;
}

/// What a synthesiser produced for one text.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutput {
    pub audio_path: PathBuf,
    pub duration_secs: f64,
    pub timings: Vec<WordTiming>,
}

/// Turns text into speech.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Synthesise `text` into `output`.
    async fn synthesize(&self, text: &str, output: &Path) -> Result<SynthesisOutput, ServiceError>;
}

/// One page-to-video request.
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest<'a> {
    pub page: &'a Path,
    /// Narration to lay under the video, if any.
    pub audio: Option<&'a Path>,
    pub duration_secs: f64,
    pub output: &'a Path,
    pub video: &'a VideoSettings,
}

/// Records a rendered page as a video clip.
#[async_trait]
pub trait PageCapture: Send + Sync {
    async fn check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn capture(&self, request: CaptureRequest<'_>) -> Result<PathBuf, ServiceError>;
}

/// Joins video clips into one file.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Concatenate `inputs` into `output`, optionally mixing in background audio.
    async fn concat(
        &self,
        inputs: &[PathBuf],
        background_audio: Option<&Path>,
        output: &Path,
    ) -> Result<PathBuf, ServiceError>;
}

/// The collaborators available to a run. A stage whose collaborator is
/// missing fails with [`crate::PipelineError::ServiceNotConfigured`].
#[derive(Clone, Default)]
pub struct Services {
    pub rewriter: Option<Arc<dyn TextRewriter>>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub capture: Option<Arc<dyn PageCapture>>,
    pub encoder: Option<Arc<dyn MediaEncoder>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewriter(mut self, rewriter: Arc<dyn TextRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn capture(mut self, capture: Arc<dyn PageCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn MediaEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("rewriter", &self.rewriter.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .field("capture", &self.capture.is_some())
            .field("encoder", &self.encoder.is_some())
            .finish()
    }
}

/// Replace `{name}` placeholders in `template`.
pub(crate) fn fill_placeholders(template: &str, values: &[(&str, String)]) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_replaced_everywhere() {
        let out = fill_placeholders(
            "{input} -> {output} ({input})",
            &[("input", "a.txt".into()), ("output", "b.mp3".into())],
        );
        assert_eq!(out, "a.txt -> b.mp3 (a.txt)");
    }

    #[test]
    fn services_debug_shows_presence() {
        let s = Services::new().encoder(Arc::new(FfmpegEncoder::new()));
        let dbg = format!("{s:?}");
        assert!(dbg.contains("encoder: true"));
        assert!(dbg.contains("rewriter: false"));
    }
}
