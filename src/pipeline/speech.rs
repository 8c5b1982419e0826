//! Speech synthesis: narration text → audio track with word timings.
//!
//! Image segments are shown for a fixed time and never reach the
//! synthesiser; neither does empty text. A failed synthesis becomes a silent
//! placeholder of `silence_fallback_secs` so the video timeline stays intact.

use super::{positions, segment_error, SegmentPos, StageContext};
use crate::cache::NS_SPEECH;
use crate::checkpoint::Stage;
use crate::error::{PipelineError, SegmentError, ServiceError};
use crate::model::{Manuscript, SpeechTrack, WordTiming};
use crate::segment::content_hash;
use crate::services::SpeechSynthesizer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Cached payload of one synthesis.
#[derive(Debug, Serialize, Deserialize)]
struct SpeechPayload {
    duration: f64,
    #[serde(default)]
    timings: Vec<WordTiming>,
}

struct Job {
    pos: SegmentPos,
    text: String,
    output: PathBuf,
}

/// Fill `speech` for every segment of `manuscript`.
pub async fn run(
    manuscript: &mut Manuscript,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    ctx: &StageContext<'_>,
) -> Result<Vec<SegmentError>, PipelineError> {
    let audio_dir = ctx.scope.audio();
    let mut jobs = Vec::new();

    for (ci, si) in positions(manuscript) {
        let segment = &mut manuscript.chapters[ci].segments[si];
        if segment.is_image() {
            segment.speech = Some(SpeechTrack::silence(ctx.config.image_display_secs));
            continue;
        }
        let text = segment.spoken_text().unwrap_or_default().trim();
        if text.is_empty() {
            segment.speech = Some(SpeechTrack::silence(ctx.config.silence_fallback_secs));
            continue;
        }
        jobs.push(Job {
            pos: (ci, si),
            text: text.to_string(),
            // Ids repeat for identical sentence runs; positions never do.
            output: audio_dir.join(format!("{ci:03}_{si:04}.{}", ctx.config.audio_format)),
        });
    }
    let total = jobs.len();
    let order: Vec<SegmentPos> = jobs.iter().map(|j| j.pos).collect();

    let cache = ctx.cache.clone();
    let scope_id = ctx.scope_id.to_string();
    let outcomes = ctx
        .pool
        .map_ordered(
            jobs,
            ctx.config.timeout(Stage::Speech),
            move |_, job: Job| {
                let synthesizer = Arc::clone(&synthesizer);
                let cache = cache.clone();
                let scope_id = scope_id.clone();
                async move {
                    let key = content_hash(&job.text);
                    if let Some(hit) = cache.lookup(NS_SPEECH, &key, &scope_id).await {
                        let audio = hit.attachment.filter(|p| p.exists());
                        let payload = serde_json::from_value::<SpeechPayload>(hit.payload).ok();
                        if let (Some(audio), Some(payload)) = (audio, payload) {
                            return Ok::<_, ServiceError>(SpeechTrack {
                                audio_path: Some(audio),
                                duration_secs: payload.duration,
                                timings: payload.timings,
                                placeholder: false,
                            });
                        }
                    }

                    let out = synthesizer.synthesize(&job.text, &job.output).await?;
                    let payload = SpeechPayload {
                        duration: out.duration_secs,
                        timings: out.timings,
                    };
                    let value = serde_json::to_value(&payload)
                        .map_err(|e| ServiceError::Failed(format!("speech payload: {e}")))?;
                    cache
                        .store(NS_SPEECH, &key, value, &scope_id, Some(&out.audio_path))
                        .await;
                    Ok(SpeechTrack {
                        audio_path: Some(out.audio_path),
                        duration_secs: payload.duration,
                        timings: payload.timings,
                        placeholder: false,
                    })
                }
            },
            |index, outcome| ctx.report(Stage::Speech, index, total, outcome),
        )
        .await;

    let mut failures = Vec::new();
    for ((ci, si), outcome) in order.into_iter().zip(outcomes) {
        let segment = &mut manuscript.chapters[ci].segments[si];
        segment.speech = Some(match outcome {
            Ok(track) => track,
            Err(failure) => {
                let err = segment_error(Stage::Speech, &segment.id, failure);
                warn!("{}; using {}s of silence", err, ctx.config.silence_fallback_secs);
                failures.push(err);
                SpeechTrack::silence(ctx.config.silence_fallback_secs)
            }
        });
    }
    info!("Speech: {} segments synthesised, {} silent fallbacks", total, failures.len());
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsStore;
    use crate::cache::PipelineCache;
    use crate::config::PipelineConfig;
    use crate::model::Segment;
    use crate::pipeline::testing::manuscript;
    use crate::pool::WorkerPool;
    use crate::services::SynthesisOutput;
    use crate::workspace::Workspace;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeTts {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeTts {
        async fn synthesize(&self, text: &str, output: &Path) -> Result<SynthesisOutput, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            tokio::fs::create_dir_all(output.parent().unwrap()).await?;
            tokio::fs::write(output, text).await?;
            Ok(SynthesisOutput {
                audio_path: output.to_path_buf(),
                duration_secs: 2.0,
                timings: vec![WordTiming {
                    text: text.into(),
                    offset_secs: 0.0,
                    duration_secs: 2.0,
                }],
            })
        }
    }

    fn setup(dir: &TempDir) -> (PipelineConfig, Workspace) {
        let config = PipelineConfig::builder()
            .data_dir(dir.path())
            .speech_timeout_secs(1)
            .build()
            .unwrap();
        let ws = Workspace::new(dir.path(), None);
        (config, ws)
    }

    #[tokio::test]
    async fn images_and_failures_get_silence() {
        let dir = TempDir::new().unwrap();
        let (config, ws) = setup(&dir);
        let cache = PipelineCache::new(Arc::new(FsStore::new(ws.clone())), true);
        let ctx = StageContext::new(&config, &ws, "s1", cache, WorkerPool::new(4));
        let mut m = manuscript(vec![vec![
            Segment::text("a", "hello."),
            Segment::image("img", "fig.png"),
            Segment::text("b", "slow one."),
            Segment::text("c", "   "),
        ]]);
        let tts = Arc::new(FakeTts { calls: AtomicUsize::new(0) });

        let failures = run(&mut m, tts.clone(), &ctx).await.unwrap();
        assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(failures.as_slice(), [SegmentError::Timeout { .. }]));

        let speech = |i: usize| m.chapters[0].segments[i].speech.clone().unwrap();
        assert_eq!(speech(0).duration_secs, 2.0);
        assert!(!speech(0).placeholder);
        assert!(speech(0).audio_path.unwrap().starts_with(dir.path().join("scopes/s1/audio")));
        assert_eq!(speech(1), SpeechTrack::silence(config.image_display_secs));
        assert_eq!(speech(2), SpeechTrack::silence(config.silence_fallback_secs));
        assert_eq!(speech(3), SpeechTrack::silence(config.silence_fallback_secs));
    }

    #[tokio::test]
    async fn narration_is_spoken_and_cached_across_scopes() {
        let dir = TempDir::new().unwrap();
        let (config, ws) = setup(&dir);
        let cache = PipelineCache::new(Arc::new(FsStore::new(ws.clone())), true);
        let tts = Arc::new(FakeTts { calls: AtomicUsize::new(0) });
        let book = || {
            let mut seg = Segment::text("a", "Written.");
            seg.narration = Some("Spoken.".into());
            manuscript(vec![vec![seg]])
        };

        let ctx1 = StageContext::new(&config, &ws, "s1", cache.clone(), WorkerPool::new(2));
        let mut first = book();
        run(&mut first, tts.clone(), &ctx1).await.unwrap();
        let audio = first.chapters[0].segments[0].speech.as_ref().unwrap().audio_path.clone().unwrap();
        assert_eq!(std::fs::read_to_string(audio).unwrap(), "Spoken.");

        let ctx2 = StageContext::new(&config, &ws, "s2", cache, WorkerPool::new(2));
        let mut second = book();
        run(&mut second, tts.clone(), &ctx2).await.unwrap();
        assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
        let track = second.chapters[0].segments[0].speech.clone().unwrap();
        assert_eq!(track.timings[0].text, "Spoken.");
        assert!(track.audio_path.unwrap().starts_with(dir.path().join("scopes/s2/cache")));
    }

    /// Writes a sidecar next to the output, waits, then reads it back and
    /// removes it, the way the command synthesizer handles its text file.
    struct SidecarTts {
        calls: AtomicUsize,
        outputs: std::sync::Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for SidecarTts {
        async fn synthesize(&self, text: &str, output: &Path) -> Result<SynthesisOutput, ServiceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs.lock().unwrap().push(output.to_path_buf());
            let sidecar = output.with_extension("input.txt");
            tokio::fs::create_dir_all(output.parent().unwrap()).await?;
            tokio::fs::write(&sidecar, text).await?;
            tokio::time::sleep(Duration::from_millis(if call == 0 { 60 } else { 10 })).await;
            let spoken = tokio::fs::read_to_string(&sidecar).await?;
            tokio::fs::remove_file(&sidecar).await?;
            tokio::fs::write(output, &spoken).await?;
            Ok(SynthesisOutput {
                audio_path: output.to_path_buf(),
                duration_secs: 1.0,
                timings: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn repeated_sentences_get_their_own_audio_files() {
        let dir = TempDir::new().unwrap();
        let (config, ws) = setup(&dir);
        let cache = PipelineCache::new(Arc::new(FsStore::new(ws.clone())), false);
        let ctx = StageContext::new(&config, &ws, "s1", cache, WorkerPool::new(2));
        let mut m = manuscript(vec![vec![
            Segment::text("p1_0a1b2c3d", "Stop right here."),
            Segment::text("p1_0a1b2c3d", "Stop right here."),
        ]]);
        let tts = Arc::new(SidecarTts {
            calls: AtomicUsize::new(0),
            outputs: std::sync::Mutex::new(Vec::new()),
        });

        let failures = run(&mut m, tts.clone(), &ctx).await.unwrap();
        assert!(failures.is_empty(), "{failures:?}");

        let outputs = tts.outputs.lock().unwrap().clone();
        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0], outputs[1]);
        let tracks: Vec<SpeechTrack> =
            m.chapters[0].segments.iter().map(|s| s.speech.clone().unwrap()).collect();
        assert!(tracks.iter().all(|t| !t.placeholder));
        assert_ne!(tracks[0].audio_path, tracks[1].audio_path);
    }
}
