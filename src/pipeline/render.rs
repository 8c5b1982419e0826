//! Page rendering: one self-contained HTML page per segment.
//!
//! ## Why self-contained pages?
//!
//! The capture engine records each page in isolation, possibly on another
//! machine or in a sandboxed browser. Inlining styles and embedding images as
//! base64 data URIs means a page is a single file with no relative paths to
//! break.
//!
//! Word timings become `<span data-offset data-duration>` elements; a small
//! inline script highlights the span being spoken as the page plays.

use crate::config::{RenderStyle, VideoSettings};
use crate::error::PipelineError;
use crate::model::{Manuscript, Segment, SegmentKind, WordTiming};
use crate::workspace::write_bytes_atomic;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HIGHLIGHT_SCRIPT: &str = r#"<script>
(function () {
  var spans = Array.prototype.slice.call(document.querySelectorAll('span[data-offset]'));
  if (!spans.length) return;
  var start = performance.now();
  function tick(now) {
    var t = (now - start) / 1000;
    spans.forEach(function (s) {
      var o = parseFloat(s.dataset.offset), d = parseFloat(s.dataset.duration);
      s.classList.toggle('active', t >= o && t < o + d);
    });
    requestAnimationFrame(tick);
  }
  requestAnimationFrame(tick);
})();
</script>"#;

/// Renders segment pages with one style and geometry.
#[derive(Debug, Clone, Copy)]
pub struct PageRenderer<'a> {
    pub style: &'a RenderStyle,
    pub video: &'a VideoSettings,
}

impl<'a> PageRenderer<'a> {
    pub fn new(style: &'a RenderStyle, video: &'a VideoSettings) -> Self {
        Self { style, video }
    }

    /// HTML for one segment. `chapter_title` is shown above the content.
    pub fn page(&self, segment: &Segment, chapter_title: Option<&str>) -> String {
        let s = self.style;
        let duration = segment.speech.as_ref().map(|t| t.duration_secs).unwrap_or(0.0);
        let mut html = String::with_capacity(4096);

        let _ = write!(
            html,
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
html, body {{ margin: 0; padding: 0; }}
body {{ width: {w}px; height: {h}px; overflow: hidden; display: flex; align-items: center; justify-content: center;
  background: {bg}; color: {fg}; font-family: {font}; font-size: {size}; line-height: {lh}; }}
main {{ box-sizing: border-box; width: 100%; height: 100%; padding: 50px; display: flex; flex-direction: column; justify-content: center; }}
h1.chapter-title {{ text-align: center; font-size: 2em; margin: 0 0 1em 0; }}
p.narration {{ margin: 0 auto; max-width: 80%; white-space: pre-wrap; }}
span.active {{ background-color: {hl}; }}
figure {{ margin: 0; text-align: center; }}
figure img {{ max-width: 90%; max-height: {img_h}px; object-fit: contain; }}
</style>
</head>
<body data-segment="{id}" data-duration="{duration:.3}">
<main>
"#,
            title = escape_html(chapter_title.unwrap_or(&segment.id)),
            w = self.video.width,
            h = self.video.height,
            bg = s.background_color,
            fg = s.text_color,
            font = s.font_family,
            size = s.font_size,
            lh = s.line_height,
            hl = s.highlight_color,
            img_h = self.video.height * 8 / 10,
            id = escape_html(&segment.id),
            duration = duration,
        );

        if let Some(title) = chapter_title {
            let _ = writeln!(html, r#"<h1 class="chapter-title">{}</h1>"#, escape_html(title));
        }

        match &segment.kind {
            SegmentKind::Text { .. } => {
                let text = segment.spoken_text().unwrap_or_default();
                let timings = segment.speech.as_ref().map(|t| t.timings.as_slice()).unwrap_or(&[]);
                let _ = writeln!(html, r#"<p class="narration">{}</p>"#, timed_text(text, timings));
            }
            SegmentKind::Image { image_path } => match image_data_uri(Path::new(image_path)) {
                Some(uri) => {
                    let _ = writeln!(html, r#"<figure><img src="{uri}" alt=""></figure>"#);
                }
                None => {
                    warn!("Image {} for segment {} is unreadable", image_path, segment.id);
                    html.push_str("<figure></figure>\n");
                }
            },
        }

        html.push_str("</main>\n");
        html.push_str(HIGHLIGHT_SCRIPT);
        html.push_str("\n</body>\n</html>\n");
        html
    }

    /// Render every segment of `manuscript` into `pages_dir` and record the
    /// page path on the segment. Returns the number of pages written.
    pub fn render_manuscript(&self, manuscript: &mut Manuscript, pages_dir: &Path) -> Result<usize, PipelineError> {
        let mut written = 0;
        for (ci, chapter) in manuscript.chapters.iter_mut().enumerate() {
            let title = chapter.title.clone();
            for (si, segment) in chapter.segments.iter_mut().enumerate() {
                let heading = (si == 0).then_some(title.as_str());
                let path = page_path(pages_dir, ci, si);
                write_bytes_atomic(&path, self.page(segment, heading).as_bytes())?;
                segment.page = Some(path);
                written += 1;
            }
        }
        debug!("Rendered {} pages into {}", written, pages_dir.display());
        Ok(written)
    }
}

/// `pages/{chapter:03}_{segment:04}.html`
pub fn page_path(pages_dir: &Path, chapter_index: usize, segment_index: usize) -> PathBuf {
    pages_dir.join(format!("{chapter_index:03}_{segment_index:04}.html"))
}

/// Wrap each timed phrase of `text` in a span, in order. Phrases that cannot
/// be found after the previous one are skipped.
fn timed_text(text: &str, timings: &[WordTiming]) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    let mut cursor = 0;
    for timing in timings {
        let phrase = timing.text.trim();
        if phrase.is_empty() {
            continue;
        }
        let Some(found) = text[cursor..].find(phrase) else {
            continue;
        };
        let start = cursor + found;
        let end = start + phrase.len();
        out.push_str(&escape_html(&text[cursor..start]));
        let _ = write!(
            out,
            r#"<span data-offset="{:.3}" data-duration="{:.3}">{}</span>"#,
            timing.offset_secs,
            timing.duration_secs,
            escape_html(phrase)
        );
        cursor = end;
    }
    out.push_str(&escape_html(&text[cursor..]));
    out
}

fn image_data_uri(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let mime = image::guess_format(&bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or_else(|_| mime_from_extension(path));
    Some(format!("data:{};base64,{}", mime, STANDARD.encode(&bytes)))
}

fn mime_from_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/jpeg",
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chapter, SpeechTrack};
    use tempfile::TempDir;

    fn timing(text: &str, offset: f64) -> WordTiming {
        WordTiming {
            text: text.into(),
            offset_secs: offset,
            duration_secs: 0.5,
        }
    }

    #[test]
    fn timed_text_wraps_phrases_in_order() {
        let html = timed_text("Tom & Jerry ran.", &[timing("Tom", 0.0), timing("Jerry", 0.5), timing("missing", 1.0)]);
        assert_eq!(
            html,
            r#"<span data-offset="0.000" data-duration="0.500">Tom</span> &amp; <span data-offset="0.500" data-duration="0.500">Jerry</span> ran."#
        );
    }

    #[test]
    fn page_escapes_and_uses_narration() {
        let style = RenderStyle::default();
        let video = VideoSettings::default();
        let mut seg = Segment::text("p_0", "Original <b>text</b>.");
        seg.narration = Some("Spoken <text>.".into());
        let html = PageRenderer::new(&style, &video).page(&seg, Some("Chapter & One"));
        assert!(html.contains("Spoken &lt;text&gt;."));
        assert!(!html.contains("Original"));
        assert!(html.contains(r#"<h1 class="chapter-title">Chapter &amp; One</h1>"#));
        assert!(html.contains("width: 1920px"));
        assert!(html.contains("#F5F5DC"));
    }

    #[test]
    fn image_page_embeds_data_uri() {
        let dir = TempDir::new().unwrap();
        let png = dir.path().join("fig.bin");
        // PNG signature is enough for format sniffing.
        std::fs::write(&png, b"\x89PNG\r\n\x1a\n0000").unwrap();
        let style = RenderStyle::default();
        let video = VideoSettings::default();
        let seg = Segment::image("p_1_img", png.to_string_lossy());
        let html = PageRenderer::new(&style, &video).page(&seg, None);
        assert!(html.contains("data:image/png;base64,"));
        assert!(!html.contains("chapter-title\">"));
    }

    #[test]
    fn title_only_on_first_segment_of_each_chapter() {
        let dir = TempDir::new().unwrap();
        let mut seg = Segment::text("p_0", "One.");
        seg.speech = Some(SpeechTrack::silence(1.0));
        let chapter = |id: &str, n: usize| Chapter {
            id: id.into(),
            title: format!("Title {id}"),
            source_file: "x.xhtml".into(),
            fragment_id: None,
            units: vec![],
            segments: vec![seg.clone(); n],
            video: None,
        };
        let mut m = Manuscript {
            scope_id: "s".into(),
            source: "b.epub".into(),
            title: "Book".into(),
            author: None,
            navigation: None,
            chapters: vec![chapter("c1", 2), chapter("c2", 1)],
            output: None,
        };
        let style = RenderStyle::default();
        let video = VideoSettings::default();
        let n = PageRenderer::new(&style, &video).render_manuscript(&mut m, dir.path()).unwrap();
        assert_eq!(n, 3);

        let read = |c: usize, s: usize| std::fs::read_to_string(m.chapters[c].segments[s].page.as_ref().unwrap()).unwrap();
        assert!(read(0, 0).contains("Title c1</h1>"));
        assert!(!read(0, 1).contains("<h1"));
        assert!(read(1, 0).contains("Title c2</h1>"));
        assert_eq!(m.chapters[1].segments[0].page.as_deref(), Some(dir.path().join("001_0000.html").as_path()));
    }
}
