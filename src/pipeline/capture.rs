//! Capture: rendered page + narration → video clip.
//!
//! Runs one page at a time, since a capture engine is usually one browser.
//! The cache key covers the page bytes and the target duration, so the same
//! page spoken at another length is recorded again. A failed capture leaves
//! `video` unset and the encoder leaves the segment out.

use super::{positions, StageContext};
use crate::cache::NS_CAPTURE;
use crate::checkpoint::Stage;
use crate::error::{PipelineError, SegmentError};
use crate::model::Manuscript;
use crate::segment::content_hash;
use crate::services::{CaptureRequest, PageCapture};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Fill `video` for every segment that has a rendered page.
pub async fn run(
    manuscript: &mut Manuscript,
    capture: Arc<dyn PageCapture>,
    ctx: &StageContext<'_>,
) -> Result<Vec<SegmentError>, PipelineError> {
    let videos_dir = ctx.scope.videos();
    let timeout = ctx.config.timeout(Stage::Capture);
    let all = positions(manuscript);
    let total = all.len();
    let mut failures = Vec::new();

    for (index, (ci, si)) in all.into_iter().enumerate() {
        let segment = &mut manuscript.chapters[ci].segments[si];
        let duration = segment
            .speech
            .as_ref()
            .map(|t| t.duration_secs)
            .unwrap_or(ctx.config.silence_fallback_secs);
        let audio = segment.speech.as_ref().and_then(|t| t.audio_path.clone());
        let output = videos_dir.join(format!("{ci:03}_{si:04}.{}", ctx.config.video.format));

        let outcome: Result<PathBuf, SegmentError> = async {
            let page = segment.page.clone().ok_or_else(|| SegmentError::ServiceFailed {
                segment: segment.id.clone(),
                stage: Stage::Capture,
                detail: "no rendered page".into(),
            })?;
            let bytes = tokio::fs::read(&page).await.map_err(|e| SegmentError::ServiceFailed {
                segment: segment.id.clone(),
                stage: Stage::Capture,
                detail: format!("cannot read {}: {e}", page.display()),
            })?;
            let key = content_hash(&format!("{}\n{duration:.3}", String::from_utf8_lossy(&bytes)));

            if let Some(video) = ctx
                .cache
                .lookup(NS_CAPTURE, &key, ctx.scope_id)
                .await
                .and_then(|hit| hit.attachment)
                .filter(|p| p.exists())
            {
                return Ok(video);
            }

            let request = CaptureRequest {
                page: &page,
                audio: audio.as_deref(),
                duration_secs: duration,
                output: &output,
                video: &ctx.config.video,
            };
            let video = match tokio::time::timeout(timeout, capture.capture(request)).await {
                Ok(Ok(video)) => video,
                Ok(Err(e)) => {
                    return Err(SegmentError::ServiceFailed {
                        segment: segment.id.clone(),
                        stage: Stage::Capture,
                        detail: e.to_string(),
                    })
                }
                Err(_) => {
                    return Err(SegmentError::Timeout {
                        segment: segment.id.clone(),
                        stage: Stage::Capture,
                        secs: timeout.as_secs(),
                    })
                }
            };
            ctx.cache
                .store(NS_CAPTURE, &key, json!({ "duration": duration }), ctx.scope_id, Some(&video))
                .await;
            Ok(video)
        }
        .await;

        match outcome {
            Ok(video) => {
                segment.video = Some(video);
                ctx.progress.on_segment_complete(Stage::Capture, index, total);
            }
            Err(err) => {
                warn!("{}; segment left out of the video", err);
                segment.video = None;
                ctx.progress
                    .on_segment_error(Stage::Capture, index, total, &err.to_string());
                failures.push(err);
            }
        }
    }
    info!("Capture: {} pages, {} failed", total, failures.len());
    Ok(failures)
}
