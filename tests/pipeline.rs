//! Integration tests for the narration pipeline.
//!
//! Books are built in memory with [`MemoryContainer`] and every external
//! collaborator is a local mock that counts its calls, so these tests run
//! offline and make no LLM, TTS or ffmpeg calls.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

use async_trait::async_trait;
use edgequake_audiobook::error::ServiceError;
use edgequake_audiobook::model::NavigationSource;
use edgequake_audiobook::services::{
    CaptureRequest, MediaEncoder, PageCapture, SpeechSynthesizer, SynthesisOutput, TextRewriter,
};
use edgequake_audiobook::{
    discard_checkpoint, inspect_container, narrate_container, MemoryContainer, PipelineConfig, PipelineError,
    SegmentError, Services, Stage,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ── Mock collaborators ───────────────────────────────────────────────────────

/// Upper-cases its input. Text containing `FAIL` is an error.
#[derive(Default)]
struct UpperRewriter {
    calls: AtomicUsize,
}

#[async_trait]
impl TextRewriter for UpperRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("FAIL") {
            return Err(ServiceError::Failed("model refused".into()));
        }
        Ok(text.to_uppercase())
    }
}

/// Sleeps longer for earlier paragraphs so completions arrive reversed.
struct SlowFirstRewriter;

#[async_trait]
impl TextRewriter for SlowFirstRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, ServiceError> {
        let n: u64 = text
            .trim_start_matches("Paragraph ")
            .trim_end_matches('.')
            .parse()
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis((12 - n.min(12)) * 10)).await;
        Ok(text.to_uppercase())
    }
}

/// Tracks how many rewrites are in flight at once.
#[derive(Default)]
struct PeakRewriter {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TextRewriter for PeakRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, ServiceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(text.to_uppercase())
    }
}

#[derive(Default)]
struct FileSynthesizer {
    calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for FileSynthesizer {
    async fn synthesize(&self, text: &str, output: &Path) -> Result<SynthesisOutput, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(output.parent().unwrap()).await?;
        tokio::fs::write(output, text.as_bytes()).await?;
        Ok(SynthesisOutput {
            audio_path: output.to_path_buf(),
            duration_secs: 1.5,
            timings: Vec::new(),
        })
    }
}

#[derive(Default)]
struct FileCapture {
    calls: AtomicUsize,
}

#[async_trait]
impl PageCapture for FileCapture {
    async fn capture(&self, request: CaptureRequest<'_>) -> Result<PathBuf, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(request.page.exists(), "page {} was not rendered", request.page.display());
        tokio::fs::create_dir_all(request.output.parent().unwrap()).await?;
        tokio::fs::write(request.output, b"clip").await?;
        Ok(request.output.to_path_buf())
    }
}

#[derive(Default)]
struct ListEncoder {
    calls: AtomicUsize,
}

#[async_trait]
impl MediaEncoder for ListEncoder {
    async fn concat(
        &self,
        inputs: &[PathBuf],
        _background_audio: Option<&Path>,
        output: &Path,
    ) -> Result<PathBuf, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(output.parent().unwrap()).await?;
        tokio::fs::write(output, format!("{inputs:?}")).await?;
        Ok(output.to_path_buf())
    }
}

/// Every mock, kept so tests can read the call counters.
#[derive(Default)]
struct Mocks {
    rewriter: Arc<UpperRewriter>,
    synthesizer: Arc<FileSynthesizer>,
    capture: Arc<FileCapture>,
    encoder: Arc<ListEncoder>,
}

impl Mocks {
    fn services(&self) -> Services {
        Services::new()
            .rewriter(self.rewriter.clone())
            .synthesizer(self.synthesizer.clone())
            .capture(self.capture.clone())
            .encoder(self.encoder.clone())
    }

    fn counts(&self) -> [usize; 4] {
        [
            self.rewriter.calls.load(Ordering::SeqCst),
            self.synthesizer.calls.load(Ordering::SeqCst),
            self.capture.calls.load(Ordering::SeqCst),
            self.encoder.calls.load(Ordering::SeqCst),
        ]
    }
}

// ── Test books ───────────────────────────────────────────────────────────────

const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="np1" playOrder="1">
      <navLabel><text>The Long Chapter</text></navLabel>
      <content src="text/ch1.xhtml"/>
    </navPoint>
    <navPoint id="np2" playOrder="2">
      <navLabel><text>The Picture</text></navLabel>
      <content src="text/ch2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

/// About 1200 characters of 40-character sentences.
fn long_paragraph() -> String {
    (1..=30)
        .map(|i| format!("Sentence number {i:02} fills up the line ok."))
        .collect::<Vec<_>>()
        .join(" ")
}

fn two_chapter_book() -> MemoryContainer {
    MemoryContainer::new()
        .title("Two Chapters")
        .author("A. Writer")
        .ncx("OEBPS/toc.ncx", NCX)
        .chapter(
            "OEBPS/text/ch1.xhtml",
            format!("<html><body><h1>One</h1><p>{}</p></body></html>", long_paragraph()),
        )
        .chapter(
            "OEBPS/text/ch2.xhtml",
            r#"<html><body><h1>Two</h1><p><img src="../images/map.png" alt=""/></p></body></html>"#,
        )
        .resource("map", "OEBPS/images/map.png", "image/png", b"\x89PNG\r\n\x1a\n".to_vec())
}

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .data_dir(dir)
        .max_segment_chars(500)
        .concurrency(4)
        .build()
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_produces_chapter_videos_and_whole_work() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();

    let report = narrate_container("book-a", &two_chapter_book(), &config(dir.path()), &mocks.services())
        .await
        .unwrap();

    assert_eq!(report.resumed_from, None);
    assert_eq!(report.completed, Stage::ALL.to_vec());
    assert_eq!(report.failure_count(), 0);

    let m = &report.manuscript;
    assert_eq!(m.title, "Two Chapters");
    let per_chapter: Vec<usize> = m.chapters.iter().map(|c| c.segments.len()).collect();
    assert_eq!(per_chapter, [3, 1]);
    for segment in &m.chapters[0].segments {
        assert!(segment.content().unwrap().chars().count() <= 500);
        assert_eq!(segment.narration, segment.content().map(str::to_uppercase));
        assert!(segment.speech.as_ref().is_some_and(|s| !s.placeholder));
    }
    let image = &m.chapters[1].segments[0];
    assert!(image.is_image());
    assert!(image.narration.is_none());
    assert!(m.chapters.iter().flat_map(|c| &c.segments).all(|s| s.video.is_some()));

    // 3 text segments are rewritten and spoken, all 4 captured; 2 chapter
    // videos plus the whole work.
    assert_eq!(mocks.counts(), [3, 3, 4, 3]);
    assert_eq!(report.chapter_videos.len(), 2);
    let output = report.output.unwrap();
    assert!(output.exists());
    assert!(output.ends_with("Two Chapters.mp4"));
}

#[tokio::test]
async fn resume_skips_completed_stages() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = two_chapter_book();

    let partial = PipelineConfig::builder()
        .data_dir(dir.path())
        .max_segment_chars(500)
        .stop_after(Stage::Speech)
        .build()
        .unwrap();
    let first = narrate_container("book-a", &book, &partial, &mocks.services()).await.unwrap();
    assert_eq!(first.completed.last(), Some(&Stage::Speech));
    assert_eq!(mocks.counts(), [3, 3, 0, 0]);

    let second = narrate_container("book-a", &book, &config(dir.path()), &mocks.services())
        .await
        .unwrap();
    assert_eq!(second.scope_id, first.scope_id);
    assert_eq!(second.resumed_from, Some(Stage::Speech));
    assert_eq!(second.completed, [Stage::Rendering, Stage::Capture, Stage::Encoding]);
    // Rewriting and speech were not re-run.
    assert_eq!(mocks.counts(), [3, 3, 4, 3]);

    // A finished book is a no-op.
    let third = narrate_container("book-a", &book, &config(dir.path()), &mocks.services())
        .await
        .unwrap();
    assert!(third.completed.is_empty());
    assert_eq!(mocks.counts(), [3, 3, 4, 3]);
    assert!(third.output.is_some());
}

#[tokio::test]
async fn missing_collaborator_stops_and_resumes_later() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = two_chapter_book();
    let services = Services::new().rewriter(mocks.rewriter.clone());

    let err = narrate_container("book-a", &book, &config(dir.path()), &services)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ServiceNotConfigured {
            stage: Stage::Speech,
            ..
        }
    ));
    assert_eq!(mocks.counts(), [3, 0, 0, 0]);

    let report = narrate_container("book-a", &book, &config(dir.path()), &mocks.services())
        .await
        .unwrap();
    assert_eq!(report.resumed_from, Some(Stage::Rewriting));
    assert_eq!(mocks.counts(), [3, 3, 4, 3]);
}

#[tokio::test]
async fn results_are_shared_across_books() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = two_chapter_book();

    let a = narrate_container("book-a", &book, &config(dir.path()), &mocks.services())
        .await
        .unwrap();
    let b = narrate_container("book-b", &book, &config(dir.path()), &mocks.services())
        .await
        .unwrap();

    assert_ne!(a.scope_id, b.scope_id);
    // Only the encoder runs again; everything else is a cache hit.
    assert_eq!(mocks.counts(), [3, 3, 4, 6]);

    // The second book owns copies of its audio under its own scope.
    let scope_b = dir.path().join("scopes").join(&b.scope_id);
    for segment in &b.manuscript.chapters[0].segments {
        let audio = segment.speech.as_ref().and_then(|s| s.audio_path.as_ref()).unwrap();
        assert!(audio.starts_with(&scope_b), "{} outside scope", audio.display());
        assert!(audio.exists());
    }
}

#[tokio::test]
async fn disabled_cache_repeats_calls() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = two_chapter_book();
    let no_cache = PipelineConfig::builder()
        .data_dir(dir.path())
        .max_segment_chars(500)
        .cache_enabled(false)
        .stop_after(Stage::Rewriting)
        .build()
        .unwrap();

    narrate_container("book-a", &book, &no_cache, &mocks.services()).await.unwrap();
    narrate_container("book-b", &book, &no_cache, &mocks.services()).await.unwrap();
    assert_eq!(mocks.counts(), [6, 0, 0, 0]);
}

#[tokio::test]
async fn segment_failure_does_not_stop_the_book() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = MemoryContainer::new()
        .title("Flaky")
        .chapter("ch1.xhtml", "<html><body><p>First part.</p><p>Please FAIL here.</p><p>Last part.</p></body></html>");
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .stop_after(Stage::Rewriting)
        .build()
        .unwrap();

    let report = narrate_container("flaky", &book, &cfg, &mocks.services()).await.unwrap();
    assert_eq!(report.failures.get(&Stage::Rewriting), Some(&1));
    assert!(matches!(
        &report.errors[0],
        SegmentError::ServiceFailed { stage: Stage::Rewriting, .. }
    ));

    let segments = &report.manuscript.chapters[0].segments;
    assert_eq!(segments[0].narration.as_deref(), Some("FIRST PART."));
    assert_eq!(segments[1].narration, None);
    // Narration falls back to the original text.
    assert_eq!(segments[1].spoken_text(), Some("Please FAIL here."));
    assert_eq!(segments[2].narration.as_deref(), Some("LAST PART."));
}

#[tokio::test]
async fn concurrent_rewrites_keep_reading_order() {
    let dir = TempDir::new().unwrap();
    let paragraphs: String = (1..=12).map(|i| format!("<p>Paragraph {i}.</p>")).collect();
    let book = MemoryContainer::new()
        .title("Ordered")
        .chapter("ch1.xhtml", format!("<html><body>{paragraphs}</body></html>"));
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .concurrency(6)
        .stop_after(Stage::Rewriting)
        .build()
        .unwrap();
    let services = Services::new().rewriter(Arc::new(SlowFirstRewriter));

    let report = narrate_container("ordered", &book, &cfg, &services).await.unwrap();
    let narrations: Vec<String> = report.manuscript.chapters[0]
        .segments
        .iter()
        .map(|s| s.narration.clone().unwrap())
        .collect();
    let expected: Vec<String> = (1..=12).map(|i| format!("PARAGRAPH {i}.")).collect();
    assert_eq!(narrations, expected);
}

#[tokio::test]
async fn malformed_navigation_map_falls_back_to_spine() {
    let dir = TempDir::new().unwrap();
    let book = MemoryContainer::new()
        .title("Broken TOC")
        .ncx("OEBPS/toc.ncx", "<ncx><navMap><navPoint")
        .chapter("OEBPS/a.xhtml", "<html><body><h1>Alpha</h1><p>First.</p></body></html>")
        .chapter("OEBPS/b.xhtml", "<html><body><h2>Beta</h2><p>Second.</p></body></html>");

    let overview = inspect_container(&book);
    assert_eq!(overview.navigation.source, NavigationSource::Spine);
    assert_eq!(overview.entries.len(), 2);

    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .stop_after(Stage::Segmentation)
        .build()
        .unwrap();
    let report = narrate_container("broken", &book, &cfg, &Services::new()).await.unwrap();
    let titles: Vec<&str> = report.manuscript.chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, ["Alpha", "Beta"]);
    assert_eq!(report.manuscript.segment_count(), 2);
}

#[tokio::test]
async fn chapter_selection_narrates_only_named_chapters() {
    let dir = TempDir::new().unwrap();
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .selection(edgequake_audiobook::ChapterSelection::parse_list("np2"))
        .stop_after(Stage::Segmentation)
        .build()
        .unwrap();
    let report = narrate_container("book-a", &two_chapter_book(), &cfg, &Services::new())
        .await
        .unwrap();
    let ids: Vec<&str> = report.manuscript.chapters.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["np2"]);
}

#[tokio::test]
async fn discarded_checkpoint_starts_over() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = two_chapter_book();
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .max_segment_chars(500)
        .stop_after(Stage::Rewriting)
        .build()
        .unwrap();

    assert!(!discard_checkpoint("book-a", &cfg).unwrap());
    narrate_container("book-a", &book, &cfg, &mocks.services()).await.unwrap();
    assert!(discard_checkpoint("book-a", &cfg).unwrap());

    let again = narrate_container("book-a", &book, &cfg, &mocks.services()).await.unwrap();
    assert_eq!(again.resumed_from, None);
    assert_eq!(again.completed.first(), Some(&Stage::Navigation));
    // Stages re-ran, but the rewrites came from the cache.
    assert_eq!(mocks.counts(), [3, 0, 0, 0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_books_share_one_concurrency_limit() {
    let dir = TempDir::new().unwrap();
    let rewriter = Arc::new(PeakRewriter::default());
    let services = Services::new().rewriter(rewriter.clone());
    let book = |name: &str| {
        let paragraphs: String = (1..=8).map(|i| format!("<p>{name} paragraph {i}.</p>")).collect();
        MemoryContainer::new()
            .title(name)
            .chapter("ch1.xhtml", format!("<html><body>{paragraphs}</body></html>"))
    };
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .concurrency(2)
        .cache_enabled(false)
        .stop_after(Stage::Rewriting)
        .build()
        .unwrap();
    let (left, right) = (book("Left"), book("Right"));

    let (a, b) = tokio::join!(
        narrate_container("left", &left, &cfg, &services),
        narrate_container("right", &right, &cfg, &services),
    );
    assert_eq!(a.unwrap().manuscript.segment_count(), 8);
    assert_eq!(b.unwrap().manuscript.segment_count(), 8);
    let peak = rewriter.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{peak} rewrites in flight with a limit of 2");
    assert!(peak >= 1);
}

#[tokio::test]
async fn repeated_sentences_keep_separate_audio() {
    let dir = TempDir::new().unwrap();
    let mocks = Mocks::default();
    let book = MemoryContainer::new()
        .title("Echo")
        .chapter("ch1.xhtml", "<html><body><p>Stop right here. Stop right here.</p></body></html>");
    let cfg = PipelineConfig::builder()
        .data_dir(dir.path())
        .max_segment_chars(20)
        .skip_rewriting(true)
        .cache_enabled(false)
        .stop_after(Stage::Speech)
        .build()
        .unwrap();

    let report = narrate_container("echo", &book, &cfg, &mocks.services()).await.unwrap();
    assert_eq!(report.failure_count(), 0);
    let segments = &report.manuscript.chapters[0].segments;
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].id, segments[1].id);
    assert_eq!(mocks.counts(), [0, 2, 0, 0]);

    let audio: Vec<PathBuf> = segments
        .iter()
        .map(|s| s.speech.as_ref().and_then(|t| t.audio_path.clone()).unwrap())
        .collect();
    assert_ne!(audio[0], audio[1]);
    assert!(audio.iter().all(|p| p.exists()));
}
