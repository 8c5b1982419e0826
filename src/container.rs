//! Book container readers.
//!
//! The rest of the crate only sees the [`Container`] trait: metadata,
//! navigation resources, reading order, raw bytes and embedded images, all
//! addressed by archive paths with `/` separators. [`EpubContainer`] reads a
//! real EPUB through the `epub` crate; [`MemoryContainer`] holds resources in
//! memory for embedders that already decoded a book (and for tests).

use crate::error::ContainerError;
use epub::doc::EpubDoc;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path};
use std::sync::Mutex;
use tracing::debug;

/// Media type of a hierarchical navigation map.
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

/// Default metadata of a book.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BookMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Kind of navigation-capable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavKind {
    /// NCX navigation map.
    Map,
    /// XHTML navigation document.
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavResource {
    pub path: String,
    pub kind: NavKind,
}

/// An embedded binary image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResource {
    /// Stable manifest identifier.
    pub id: String,
    pub path: String,
    pub media_type: String,
}

/// Read access to an e-book container.
pub trait Container: Send + Sync {
    fn metadata(&self) -> BookMetadata;

    /// Navigation resources, maps before documents.
    fn navigation_resources(&self) -> Vec<NavResource>;

    /// Content documents in reading order.
    fn spine(&self) -> Vec<String>;

    /// Raw bytes of a resource.
    fn read(&self, path: &str) -> Result<Vec<u8>, ContainerError>;

    fn images(&self) -> Vec<ImageResource>;
}

// ── EPUB ─────────────────────────────────────────────────────────────────

struct ManifestItem {
    id: String,
    path: String,
    media_type: String,
    properties: Option<String>,
}

/// [`Container`] backed by an EPUB file on disk.
pub struct EpubContainer {
    doc: Mutex<EpubDoc<BufReader<File>>>,
    metadata: BookMetadata,
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
}

impl EpubContainer {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        let doc = EpubDoc::new(path).map_err(|e| ContainerError::Open {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

        let metadata = BookMetadata {
            title: doc.mdata("title").map(|m| m.value.trim().to_string()).filter(|t| !t.is_empty()),
            author: doc.mdata("creator").map(|m| m.value.trim().to_string()).filter(|a| !a.is_empty()),
        };

        let mut manifest: Vec<ManifestItem> = doc
            .resources
            .iter()
            .map(|(id, item)| ManifestItem {
                id: id.clone(),
                path: archive_path(&item.path),
                media_type: item.mime.clone(),
                properties: item.properties.clone(),
            })
            .collect();
        manifest.sort_by(|a, b| a.path.cmp(&b.path));

        let spine = doc
            .spine
            .iter()
            .filter_map(|item| doc.resources.get(&item.idref))
            .map(|item| archive_path(&item.path))
            .collect();

        debug!(
            "Opened EPUB {}: {} manifest items",
            path.display(),
            manifest.len()
        );

        Ok(Self {
            doc: Mutex::new(doc),
            metadata,
            manifest,
            spine,
        })
    }
}

impl Container for EpubContainer {
    fn metadata(&self) -> BookMetadata {
        self.metadata.clone()
    }

    fn navigation_resources(&self) -> Vec<NavResource> {
        let maps = self
            .manifest
            .iter()
            .filter(|m| m.media_type == NCX_MEDIA_TYPE)
            .map(|m| NavResource {
                path: m.path.clone(),
                kind: NavKind::Map,
            });
        let docs = self
            .manifest
            .iter()
            .filter(|m| {
                m.properties
                    .as_deref()
                    .is_some_and(|p| p.split_whitespace().any(|p| p == "nav"))
            })
            .map(|m| NavResource {
                path: m.path.clone(),
                kind: NavKind::Document,
            });
        maps.chain(docs).collect()
    }

    fn spine(&self) -> Vec<String> {
        self.spine.clone()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ContainerError> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| ContainerError::MissingResource(path.to_string()))?;
        doc.get_resource_by_path(path)
            .ok_or_else(|| ContainerError::MissingResource(path.to_string()))
    }

    fn images(&self) -> Vec<ImageResource> {
        self.manifest
            .iter()
            .filter(|m| m.media_type.starts_with("image/"))
            .map(|m| ImageResource {
                id: m.id.clone(),
                path: m.path.clone(),
                media_type: m.media_type.clone(),
            })
            .collect()
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

struct MemoryResource {
    id: String,
    media_type: String,
    bytes: Vec<u8>,
}

/// [`Container`] over resources held in memory.
#[derive(Default)]
pub struct MemoryContainer {
    metadata: BookMetadata,
    resources: HashMap<String, MemoryResource>,
    order: Vec<String>,
    spine: Vec<String>,
    nav: Vec<NavResource>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.metadata.title = Some(title.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = Some(author.into());
        self
    }

    /// Add a resource without placing it in the reading order.
    pub fn resource(
        mut self,
        id: impl Into<String>,
        path: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        let path = path.into();
        if !self.resources.contains_key(&path) {
            self.order.push(path.clone());
        }
        self.resources.insert(
            path,
            MemoryResource {
                id: id.into(),
                media_type: media_type.into(),
                bytes: bytes.into(),
            },
        );
        self
    }

    /// Add an XHTML content document at the end of the reading order.
    pub fn chapter(self, path: impl Into<String>, markup: impl Into<String>) -> Self {
        let path = path.into();
        let id = format!("item{}", self.order.len());
        let mut this = self.resource(id, path.clone(), "application/xhtml+xml", markup.into());
        this.spine.push(path);
        this
    }

    pub fn ncx(self, path: impl Into<String>, xml: impl Into<String>) -> Self {
        let path = path.into();
        let mut this = self.resource("ncx", path.clone(), NCX_MEDIA_TYPE, xml.into());
        this.nav.push(NavResource { path, kind: NavKind::Map });
        this
    }

    pub fn nav_document(self, path: impl Into<String>, markup: impl Into<String>) -> Self {
        let path = path.into();
        let mut this = self.resource("nav", path.clone(), "application/xhtml+xml", markup.into());
        this.nav.push(NavResource {
            path,
            kind: NavKind::Document,
        });
        this
    }
}

impl Container for MemoryContainer {
    fn metadata(&self) -> BookMetadata {
        self.metadata.clone()
    }

    fn navigation_resources(&self) -> Vec<NavResource> {
        let mut nav = self.nav.clone();
        nav.sort_by_key(|n| match n.kind {
            NavKind::Map => 0,
            NavKind::Document => 1,
        });
        nav
    }

    fn spine(&self) -> Vec<String> {
        self.spine.clone()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ContainerError> {
        self.resources
            .get(path)
            .map(|r| r.bytes.clone())
            .ok_or_else(|| ContainerError::MissingResource(path.to_string()))
    }

    fn images(&self) -> Vec<ImageResource> {
        self.order
            .iter()
            .filter_map(|path| self.resources.get(path).map(|r| (path, r)))
            .filter(|(_, r)| r.media_type.starts_with("image/"))
            .map(|(path, r)| ImageResource {
                id: r.id.clone(),
                path: path.clone(),
                media_type: r.media_type.clone(),
            })
            .collect()
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────

fn archive_path(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// Split an href into `(path, fragment)`.
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, frag)) if !frag.is_empty() => (path, Some(frag)),
        Some((path, _)) => (path, None),
        None => (href, None),
    }
}

/// Resolve `href` relative to the directory of `base_file`.
///
/// Handles `.` and `..` segments; a leading `/` is taken as archive root.
/// Percent-encoded spaces are decoded.
pub fn resolve_href(base_file: &str, href: &str) -> String {
    let href = href.replace("%20", " ");
    let mut parts: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        let mut base: Vec<&str> = base_file.split('/').collect();
        base.pop();
        base
    };
    for seg in href.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join("/")
}

/// Directory of an archive path, `""` at the root.
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_hrefs() {
        assert_eq!(resolve_href("OEBPS/toc.ncx", "text/ch1.xhtml"), "OEBPS/text/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/text/nav.xhtml", "../images/a.png"), "OEBPS/images/a.png");
        assert_eq!(resolve_href("OEBPS/text/nav.xhtml", "./ch2.xhtml"), "OEBPS/text/ch2.xhtml");
        assert_eq!(resolve_href("toc.ncx", "ch1.xhtml"), "ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/a.xhtml", "/root.xhtml"), "root.xhtml");
        assert_eq!(resolve_href("OEBPS/a.xhtml", "my%20file.xhtml"), "OEBPS/my file.xhtml");
    }

    #[test]
    fn split_fragment_cases() {
        assert_eq!(split_fragment("ch1.xhtml#sec2"), ("ch1.xhtml", Some("sec2")));
        assert_eq!(split_fragment("ch1.xhtml#"), ("ch1.xhtml", None));
        assert_eq!(split_fragment("ch1.xhtml"), ("ch1.xhtml", None));
    }

    #[test]
    fn memory_container_basics() {
        let c = MemoryContainer::new()
            .title("T")
            .chapter("OEBPS/c1.xhtml", "<p>a</p>")
            .resource("img1", "OEBPS/i.png", "image/png", vec![1u8, 2, 3])
            .nav_document("OEBPS/nav.xhtml", "<nav/>")
            .ncx("OEBPS/toc.ncx", "<ncx/>");
        assert_eq!(c.spine(), vec!["OEBPS/c1.xhtml".to_string()]);
        assert_eq!(c.read("OEBPS/i.png").unwrap(), vec![1, 2, 3]);
        assert!(c.read("missing").is_err());
        assert_eq!(c.images()[0].id, "img1");
        let nav = c.navigation_resources();
        assert_eq!(nav[0].kind, NavKind::Map);
        assert_eq!(nav[1].kind, NavKind::Document);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_dir("a/b/c.xhtml"), "a/b");
        assert_eq!(parent_dir("c.xhtml"), "");
        assert_eq!(file_name("a/b/c.xhtml"), "c.xhtml");
        assert_eq!(archive_path(Path::new("OEBPS/Text/ch1.xhtml")), "OEBPS/Text/ch1.xhtml");
    }
}
