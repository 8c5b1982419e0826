//! Encoding: segment clips → chapter videos → whole-work video.
//!
//! ```text
//! <output_dir>/<scope>_<title>/
//!     001_<chapter title>.mp4     one per chapter with at least one clip
//!     <title>.mp4                 every chapter video, plus background audio
//!     <scope>_info.json           what was produced
//! ```
//!
//! A chapter whose concatenation fails is left out of the whole work. The
//! final concatenation is the one call that cannot degrade: without it there
//! is no output, so its failure is fatal and the capture checkpoint stays.

use super::StageContext;
use crate::checkpoint::Stage;
use crate::error::{PipelineError, SegmentError, ServiceError};
use crate::model::{Manuscript, WorkOutput};
use crate::services::MediaEncoder;
use crate::workspace::{sanitize_file_name, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Summary written next to the final media.
#[derive(Debug, Serialize)]
struct BookInfo<'a> {
    scope_id: &'a str,
    title: &'a str,
    author: Option<&'a str>,
    source: &'a str,
    output: &'a Path,
    chapters: Vec<ChapterInfo<'a>>,
    encoded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ChapterInfo<'a> {
    id: &'a str,
    title: &'a str,
    segments: usize,
    video: Option<&'a Path>,
}

/// Assemble chapter videos and the whole work.
pub async fn run(
    manuscript: &mut Manuscript,
    encoder: Arc<dyn MediaEncoder>,
    ctx: &StageContext<'_>,
) -> Result<Vec<SegmentError>, PipelineError> {
    let timeout = ctx.config.timeout(Stage::Encoding);
    let format = &ctx.config.video.format;
    let book_dir = ctx.workspace.book_output_dir(ctx.scope_id, &manuscript.title);
    let total = manuscript.chapters.len();
    let mut failures = Vec::new();
    let mut chapter_videos = Vec::new();

    for (index, chapter) in manuscript.chapters.iter_mut().enumerate() {
        let clips: Vec<PathBuf> = chapter.segments.iter().filter_map(|s| s.video.clone()).collect();
        if clips.is_empty() {
            warn!("Chapter {} ({}) has no clips, skipped", chapter.id, chapter.title);
            chapter.video = None;
            continue;
        }
        let output = book_dir.join(format!(
            "{:03}_{}.{}",
            index + 1,
            sanitize_file_name(&chapter.title),
            format
        ));
        match concat(encoder.as_ref(), &clips, None, &output, timeout).await {
            Ok(video) => {
                info!("Chapter {} encoded from {} clips", chapter.id, clips.len());
                chapter.video = Some(video.clone());
                chapter_videos.push(video);
                ctx.progress.on_segment_complete(Stage::Encoding, index, total);
            }
            Err(e) => {
                let err = match e {
                    ServiceError::Timeout { secs } => SegmentError::Timeout {
                        segment: chapter.id.clone(),
                        stage: Stage::Encoding,
                        secs,
                    },
                    other => SegmentError::ServiceFailed {
                        segment: chapter.id.clone(),
                        stage: Stage::Encoding,
                        detail: other.to_string(),
                    },
                };
                warn!("{}; chapter left out", err);
                chapter.video = None;
                ctx.progress
                    .on_segment_error(Stage::Encoding, index, total, &err.to_string());
                failures.push(err);
            }
        }
    }

    if chapter_videos.is_empty() {
        return Err(PipelineError::NothingToEncode);
    }

    let work = book_dir.join(format!("{}.{}", sanitize_file_name(&manuscript.title), format));
    let background = ctx.config.background_audio.as_deref();
    let path = concat(encoder.as_ref(), &chapter_videos, background, &work, timeout)
        .await
        .map_err(|e| PipelineError::ServiceUnavailable {
            stage: Stage::Encoding,
            service: "media encoder",
            detail: e.to_string(),
        })?;

    let encoded_at = Utc::now();
    let info_path = book_dir.join(format!("{}_info.json", ctx.scope_id));
    let info = BookInfo {
        scope_id: ctx.scope_id,
        title: &manuscript.title,
        author: manuscript.author.as_deref(),
        source: &manuscript.source,
        output: &path,
        chapters: manuscript
            .chapters
            .iter()
            .map(|c| ChapterInfo {
                id: &c.id,
                title: &c.title,
                segments: c.segments.len(),
                video: c.video.as_deref(),
            })
            .collect(),
        encoded_at,
    };
    write_json_atomic(&info_path, &info)?;

    info!("Encoded {} chapters into {}", chapter_videos.len(), path.display());
    manuscript.output = Some(WorkOutput {
        path,
        chapter_videos,
        info_path,
        encoded_at,
    });
    Ok(failures)
}

async fn concat(
    encoder: &dyn MediaEncoder,
    inputs: &[PathBuf],
    background: Option<&Path>,
    output: &Path,
    timeout: Duration,
) -> Result<PathBuf, ServiceError> {
    tokio::time::timeout(timeout, encoder.concat(inputs, background, output))
        .await
        .map_err(|_| ServiceError::Timeout {
            secs: timeout.as_secs(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::model::Segment;
    use crate::pipeline::testing::{manuscript, memory_cache};
    use crate::pool::WorkerPool;
    use crate::workspace::Workspace;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes the input list into the output file.
    #[derive(Default)]
    struct ListEncoder {
        calls: Mutex<Vec<(usize, bool)>>,
    }

    #[async_trait]
    impl MediaEncoder for ListEncoder {
        async fn concat(
            &self,
            inputs: &[PathBuf],
            background_audio: Option<&Path>,
            output: &Path,
        ) -> Result<PathBuf, ServiceError> {
            self.calls.lock().unwrap().push((inputs.len(), background_audio.is_some()));
            std::fs::create_dir_all(output.parent().unwrap())?;
            std::fs::write(output, format!("{inputs:?}"))?;
            Ok(output.to_path_buf())
        }
    }

    fn clip(id: &str, video: Option<&str>) -> Segment {
        let mut seg = Segment::text(id, "x");
        seg.video = video.map(PathBuf::from);
        seg
    }

    #[tokio::test]
    async fn chapters_then_whole_work_then_info() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::builder()
            .data_dir(dir.path())
            .background_audio("/music/bgm.mp3")
            .build()
            .unwrap();
        let ws = Workspace::new(dir.path(), None);
        let ctx = StageContext::new(&config, &ws, "s1", memory_cache(), WorkerPool::new(1));
        let mut m = manuscript(vec![
            vec![clip("a", Some("/v/a.mp4")), clip("b", None), clip("c", Some("/v/c.mp4"))],
            vec![clip("d", None)],
            vec![clip("e", Some("/v/e.mp4"))],
        ]);
        let enc = Arc::new(ListEncoder::default());

        let failures = run(&mut m, enc.clone(), &ctx).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(*enc.calls.lock().unwrap(), [(2, false), (1, false), (2, true)]);

        let book_dir = dir.path().join("outputs/s1_Test Book");
        assert_eq!(m.chapters[0].video, Some(book_dir.join("001_Chapter 1.mp4")));
        assert_eq!(m.chapters[1].video, None);
        assert_eq!(m.chapters[2].video, Some(book_dir.join("003_Chapter 3.mp4")));

        let output = m.output.unwrap();
        assert_eq!(output.path, book_dir.join("Test Book.mp4"));
        let info: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&output.info_path).unwrap()).unwrap();
        assert_eq!(info["scope_id"], "s1");
        assert_eq!(info["chapters"][0]["segments"], 3);
        assert!(info["chapters"][1]["video"].is_null());
    }

    #[tokio::test]
    async fn no_clips_at_all_is_nothing_to_encode() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let ws = Workspace::new(dir.path(), None);
        let ctx = StageContext::new(&config, &ws, "s1", memory_cache(), WorkerPool::new(1));
        let mut m = manuscript(vec![vec![clip("a", None)]]);
        let err = run(&mut m, Arc::new(ListEncoder::default()), &ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::NothingToEncode));
        assert!(m.output.is_none());
    }
}
