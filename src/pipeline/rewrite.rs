//! Rewriting: written prose → narration text.
//!
//! One task per text segment, fanned out over the shared pool. A segment
//! whose rewrite fails keeps its original content (narration stays `None`,
//! so later stages speak the original) and nothing is cached for it.

use super::{positions, segment_error, SegmentPos, StageContext};
use crate::cache::NS_REWRITE;
use crate::checkpoint::Stage;
use crate::error::{PipelineError, SegmentError, ServiceError};
use crate::model::Manuscript;
use crate::segment::content_hash;
use crate::services::TextRewriter;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

struct Job {
    pos: SegmentPos,
    content: String,
}

/// Fill `narration` for every text segment of `manuscript`.
pub async fn run(
    manuscript: &mut Manuscript,
    rewriter: Arc<dyn TextRewriter>,
    ctx: &StageContext<'_>,
) -> Result<Vec<SegmentError>, PipelineError> {
    let jobs: Vec<Job> = positions(manuscript)
        .into_iter()
        .filter_map(|pos| {
            let content = manuscript.chapters[pos.0].segments[pos.1].content()?.trim();
            (!content.is_empty()).then(|| Job {
                pos,
                content: content.to_string(),
            })
        })
        .collect();
    let total = jobs.len();
    let order: Vec<SegmentPos> = jobs.iter().map(|j| j.pos).collect();

    let cache = ctx.cache.clone();
    let scope_id = ctx.scope_id.to_string();
    let outcomes = ctx
        .pool
        .map_ordered(
            jobs,
            ctx.config.timeout(Stage::Rewriting),
            move |_, job: Job| {
                let rewriter = Arc::clone(&rewriter);
                let cache = cache.clone();
                let scope_id = scope_id.clone();
                async move {
                    let key = content_hash(&job.content);
                    if let Some(text) = cache
                        .lookup(NS_REWRITE, &key, &scope_id)
                        .await
                        .and_then(|hit| hit.payload["text"].as_str().map(str::to_string))
                    {
                        return Ok::<_, ServiceError>(text);
                    }
                    let text = rewriter.rewrite(&job.content).await?;
                    cache
                        .store(NS_REWRITE, &key, json!({ "text": text }), &scope_id, None)
                        .await;
                    Ok(text)
                }
            },
            |index, outcome| ctx.report(Stage::Rewriting, index, total, outcome),
        )
        .await;

    let mut failures = Vec::new();
    for ((ci, si), outcome) in order.into_iter().zip(outcomes) {
        let segment = &mut manuscript.chapters[ci].segments[si];
        match outcome {
            Ok(text) => segment.narration = Some(text),
            Err(failure) => {
                let err = segment_error(Stage::Rewriting, &segment.id, failure);
                warn!("{}; keeping original text", err);
                segment.narration = None;
                failures.push(err);
            }
        }
    }
    info!("Rewriting: {} segments, {} kept original", total, failures.len());
    Ok(failures)
}
