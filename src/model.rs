//! Data model shared by every pipeline stage.
//!
//! The tree ([`Navigation`]) is the source of truth for a book's structure;
//! [`FlatNavigationEntry`] is a pure projection re-derived on demand and never
//! persisted on its own. A [`Segment`] is created by the segmenter and only
//! grows afterwards: stages fill in `narration`, `speech`, `page` and `video`
//! but never touch `id` or the original content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Placeholder title for navigation entries that carry no label.
pub const UNTITLED_CHAPTER: &str = "untitled chapter";

// ── Navigation ───────────────────────────────────────────────────────────

/// One node in the canonical table-of-contents tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationNode {
    /// Unique across the whole tree.
    pub id: String,
    pub title: String,
    /// Depth in the tree, roots are 0.
    pub level: usize,
    /// Archive path of the content document.
    pub source_file: String,
    /// In-file anchor, if the reference carried one.
    pub fragment_id: Option<String>,
    /// Children in reading order.
    pub children: Vec<NavigationNode>,
}

/// Pre-order projection of a [`NavigationNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNavigationEntry {
    pub id: String,
    pub title: String,
    pub level: usize,
    pub source_file: String,
    pub fragment_id: Option<String>,
    /// Title of the nearest ancestor; `None` at depth 0.
    pub parent_title: Option<String>,
}

/// Which resolution strategy produced a [`Navigation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationSource {
    /// Hierarchical navigation map resource (NCX).
    NavigationMap,
    /// Inline navigation document (`<nav epub:type="toc">`).
    NavigationDocument,
    /// Synthesised from the reading order.
    Spine,
}

impl NavigationSource {
    /// `true` when the tree came from real navigation metadata.
    pub fn is_structured(self) -> bool {
        !matches!(self, NavigationSource::Spine)
    }
}

/// A resolved navigation forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    pub source: NavigationSource,
    pub roots: Vec<NavigationNode>,
}

impl Navigation {
    /// Depth-first, parent-before-children projection of the tree.
    ///
    /// Uses an explicit stack so arbitrarily deep trees cannot overflow.
    pub fn flatten(&self) -> Vec<FlatNavigationEntry> {
        let mut out = Vec::new();
        let mut stack: Vec<(&NavigationNode, Option<&str>)> =
            self.roots.iter().rev().map(|n| (n, None)).collect();

        while let Some((node, parent_title)) = stack.pop() {
            out.push(FlatNavigationEntry {
                id: node.id.clone(),
                title: node.title.clone(),
                level: node.level,
                source_file: node.source_file.clone(),
                fragment_id: node.fragment_id.clone(),
                parent_title: parent_title.map(str::to_string),
            });
            for child in node.children.iter().rev() {
                stack.push((child, Some(node.title.as_str())));
            }
        }
        out
    }

    /// Total number of nodes in the forest.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<&NavigationNode> = self.roots.iter().collect();
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

// ── Content ──────────────────────────────────────────────────────────────

/// One extracted unit before segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentUnit {
    Text { id: String, content: String },
    Image { id: String, image_path: String },
}

impl ContentUnit {
    pub fn id(&self) -> &str {
        match self {
            ContentUnit::Text { id, .. } | ContentUnit::Image { id, .. } => id,
        }
    }
}

/// What a segment carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentKind {
    Text { content: String },
    Image { image_path: String },
}

/// One word or phrase span inside a speech track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub text: String,
    pub offset_secs: f64,
    pub duration_secs: f64,
}

/// Audio produced for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechTrack {
    /// `None` means silence of `duration_secs`.
    pub audio_path: Option<PathBuf>,
    pub duration_secs: f64,
    #[serde(default)]
    pub timings: Vec<WordTiming>,
    /// Set when the track is a substitute for a failed or skipped synthesis.
    #[serde(default)]
    pub placeholder: bool,
}

impl SpeechTrack {
    pub fn silence(duration_secs: f64) -> Self {
        Self {
            audio_path: None,
            duration_secs,
            timings: Vec::new(),
            placeholder: true,
        }
    }
}

/// Minimal narration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    #[serde(flatten)]
    pub kind: SegmentKind,
    /// Rewritten text for narration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechTrack>,
    /// Rendered HTML page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PathBuf>,
    /// Captured video clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
}

impl Segment {
    pub fn text(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id.into(), SegmentKind::Text { content: content.into() })
    }

    pub fn image(id: impl Into<String>, image_path: impl Into<String>) -> Self {
        Self::new(
            id.into(),
            SegmentKind::Image {
                image_path: image_path.into(),
            },
        )
    }

    fn new(id: String, kind: SegmentKind) -> Self {
        Self {
            id,
            kind,
            narration: None,
            speech: None,
            page: None,
            video: None,
        }
    }

    /// Original text, `None` for images.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            SegmentKind::Text { content } => Some(content),
            SegmentKind::Image { .. } => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, SegmentKind::Image { .. })
    }

    /// Text to speak: the narration when present, else the original.
    pub fn spoken_text(&self) -> Option<&str> {
        self.narration.as_deref().or_else(|| self.content())
    }
}

/// One chapter and its segments in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub source_file: String,
    pub fragment_id: Option<String>,
    /// Extracted units; emptied once segmentation has run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<ContentUnit>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<PathBuf>,
}

/// Final artefacts of the encoding stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub path: PathBuf,
    pub chapter_videos: Vec<PathBuf>,
    pub info_path: PathBuf,
    pub encoded_at: DateTime<Utc>,
}

/// The whole book as it travels between stages.
///
/// This is the value persisted after every stage and read back on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manuscript {
    pub scope_id: String,
    /// Stable document identifier (canonical path or URL).
    pub source: String,
    pub title: String,
    pub author: Option<String>,
    pub navigation: Option<Navigation>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<WorkOutput>,
}

impl Manuscript {
    pub fn segment_count(&self) -> usize {
        self.chapters.iter().map(|c| c.segments.len()).sum()
    }
}
