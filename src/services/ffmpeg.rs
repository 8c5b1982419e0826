//! Video concatenation with `ffmpeg`.
//!
//! Clips are joined with the concat demuxer and stream copy, so joining is
//! a remux, not a re-encode. Background audio forces an audio re-encode: it
//! is looped under the narration with `amix` and the video stream is still
//! copied.

use super::MediaEncoder;
use crate::error::ServiceError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// [`MediaEncoder`] that shells out to `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
    background_volume: f32,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            background_volume: 0.3,
        }
    }

    /// Use a specific `ffmpeg` binary instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Volume of background audio relative to narration. Default: 0.3.
    pub fn background_volume(mut self, v: f32) -> Self {
        self.background_volume = v.clamp(0.0, 1.0);
        self
    }
}

/// Body of a concat-demuxer list file.
fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

fn ffmpeg_args(list: &Path, background_audio: Option<&Path>, volume: f32, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(list.to_string_lossy().into_owned());

    match background_audio {
        Some(bgm) => {
            args.extend(["-stream_loop", "-1", "-i"].map(String::from));
            args.push(bgm.to_string_lossy().into_owned());
            args.push("-filter_complex".into());
            args.push(format!(
                "[1:a]volume={volume:.2}[bg];[0:a][bg]amix=inputs=2:duration=first:dropout_transition=0[a]"
            ));
            args.extend(["-map", "0:v", "-map", "[a]", "-c:v", "copy", "-c:a", "aac", "-ac", "2"].map(String::from));
        }
        None => args.extend(["-c", "copy"].map(String::from)),
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn check(&self) -> Result<(), ServiceError> {
        which::which(&self.binary).map(|_| ()).map_err(|e| {
            ServiceError::Unavailable(format!(
                "'{}' not found ({e}). Install ffmpeg or put it on PATH.",
                self.binary.display()
            ))
        })
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        background_audio: Option<&Path>,
        output: &Path,
    ) -> Result<PathBuf, ServiceError> {
        if inputs.is_empty() {
            return Err(ServiceError::Failed("no clips to concatenate".into()));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list = output.with_extension("concat.txt");
        tokio::fs::write(&list, concat_list(inputs)).await?;

        let args = ffmpeg_args(&list, background_audio, self.background_volume, output);
        debug!("ffmpeg {}", args.join(" "));
        let result = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&list).await;

        let out = result.map_err(|e| ServiceError::Unavailable(format!("cannot run ffmpeg: {e}")))?;
        if !out.status.success() {
            return Err(ServiceError::Failed(format!(
                "ffmpeg exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        info!("Joined {} clips into {}", inputs.len(), output.display());
        Ok(output.to_path_buf())
    }
}
