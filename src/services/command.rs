//! Subprocess adapters for speech synthesis and page capture.
//!
//! Both take a command template whose whitespace-separated words become the
//! argument vector; `{name}` placeholders are substituted per word, so a path
//! containing spaces stays one argument. Children are spawned with
//! `kill_on_drop`, so a stage timeout that drops the future also reaps the
//! process.

use super::{fill_placeholders, CaptureRequest, PageCapture, SpeechSynthesizer, SynthesisOutput};
use crate::error::ServiceError;
use crate::model::WordTiming;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Narration speed assumed when a synthesiser reports no duration.
pub const SECS_PER_CHAR: f64 = 0.1;

/// A parsed command template.
#[derive(Debug, Clone)]
struct Template {
    words: Vec<String>,
}

impl Template {
    fn parse(template: &str) -> Result<Self, ServiceError> {
        let words: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Err(ServiceError::Unavailable("empty command template".into()));
        }
        Ok(Self { words })
    }

    fn program(&self) -> &str {
        &self.words[0]
    }

    fn check(&self) -> Result<(), ServiceError> {
        which::which(self.program())
            .map(|_| ())
            .map_err(|e| ServiceError::Unavailable(format!("'{}' not found: {e}", self.program())))
    }

    async fn run(&self, values: &[(&str, String)]) -> Result<(), ServiceError> {
        let args: Vec<String> = self.words[1..]
            .iter()
            .map(|w| fill_placeholders(w, values))
            .collect();
        debug!("Running {} {}", self.program(), args.join(" "));

        let output = Command::new(self.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("cannot run '{}': {e}", self.program())))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let chars: Vec<char> = stderr.trim().chars().collect();
            let tail: String = chars[chars.len().saturating_sub(400)..].iter().collect();
            Err(ServiceError::Failed(format!(
                "'{}' exited with {}: {}",
                self.program(),
                output.status,
                tail
            )))
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn require_file(path: &Path, program: &str) -> Result<(), ServiceError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(ServiceError::Failed(format!(
            "'{program}' produced no output at {}",
            path.display()
        ))),
    }
}

// ── Speech ───────────────────────────────────────────────────────────────

/// Timing sidecar written by a synthesiser next to its audio.
#[derive(Debug, Deserialize)]
struct TimingSidecar {
    duration: f64,
    #[serde(default)]
    timings: Vec<SidecarSpan>,
}

#[derive(Debug, Deserialize)]
struct SidecarSpan {
    text: String,
    offset: f64,
    duration: f64,
}

/// [`SpeechSynthesizer`] that runs an external TTS program.
///
/// Placeholders: `{input}` (a UTF-8 text file holding the text), `{output}`
/// (audio path to write), `{timings}` (optional JSON sidecar
/// `{"duration": f64, "timings": [{"text", "offset", "duration"}]}`).
/// Without a sidecar the duration is estimated from the text length.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    template: Template,
}

impl CommandSynthesizer {
    pub fn new(template: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            template: Template::parse(template)?,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    async fn check(&self) -> Result<(), ServiceError> {
        self.template.check()
    }

    async fn synthesize(&self, text: &str, output: &Path) -> Result<SynthesisOutput, ServiceError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let input = output.with_extension("input.txt");
        let sidecar = output.with_extension("timings.json");
        tokio::fs::write(&input, text).await?;
        let _ = tokio::fs::remove_file(&sidecar).await;

        let result = self
            .template
            .run(&[
                ("input", display(&input)),
                ("output", display(output)),
                ("timings", display(&sidecar)),
            ])
            .await;
        let _ = tokio::fs::remove_file(&input).await;
        result?;
        require_file(output, self.template.program()).await?;

        let estimated = text.chars().count() as f64 * SECS_PER_CHAR;
        let (duration_secs, timings) = match tokio::fs::read(&sidecar).await {
            Ok(raw) => {
                let parsed: TimingSidecar = serde_json::from_slice(&raw)
                    .map_err(|e| ServiceError::Failed(format!("bad timing sidecar: {e}")))?;
                let timings = parsed
                    .timings
                    .into_iter()
                    .map(|s| WordTiming {
                        text: s.text,
                        offset_secs: s.offset,
                        duration_secs: s.duration,
                    })
                    .collect();
                let duration = if parsed.duration > 0.0 { parsed.duration } else { estimated };
                (duration, timings)
            }
            Err(_) => (estimated, Vec::new()),
        };

        Ok(SynthesisOutput {
            audio_path: output.to_path_buf(),
            duration_secs,
            timings,
        })
    }
}

// ── Capture ──────────────────────────────────────────────────────────────

/// [`PageCapture`] that runs an external recorder.
///
/// Placeholders: `{page}`, `{audio}` (empty when the segment is silent),
/// `{duration}` (seconds), `{output}`, `{width}`, `{height}`, `{fps}`.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    template: Template,
}

impl CommandCapture {
    pub fn new(template: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            template: Template::parse(template)?,
        })
    }
}

#[async_trait]
impl PageCapture for CommandCapture {
    async fn check(&self) -> Result<(), ServiceError> {
        self.template.check()
    }

    async fn capture(&self, request: CaptureRequest<'_>) -> Result<PathBuf, ServiceError> {
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.template
            .run(&[
                ("page", display(request.page)),
                ("audio", request.audio.map(display).unwrap_or_default()),
                ("duration", format!("{:.3}", request.duration_secs)),
                ("output", display(request.output)),
                ("width", request.video.width.to_string()),
                ("height", request.video.height.to_string()),
                ("fps", request.video.fps.to_string()),
            ])
            .await?;
        require_file(request.output, self.template.program()).await?;
        Ok(request.output.to_path_buf())
    }
}
