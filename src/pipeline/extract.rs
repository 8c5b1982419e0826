//! Extraction: navigation entries → chapters of content units.
//!
//! Two plans:
//!
//! * **Navigation-driven** (the book carried a navigation map or document):
//!   one chapter per flattened entry in reading order. A file is narrated
//!   once, so once a file has been extracted whole every later entry into it
//!   is skipped. Fragment entries into a file not yet taken whole get the
//!   content of their anchor.
//! * **Per-file** (navigation was synthesised from the spine): one chapter
//!   per content document. Cover and table-of-contents files are skipped
//!   unless selected by id.
//!
//! Embedded images are exported to the scope's `images/` directory first so
//! units can reference them by local path.

use crate::config::ChapterSelection;
use crate::container::{file_name, Container};
use crate::error::PipelineError;
use crate::markup::{chapter_title, extract_fragment_units, extract_units, ImageMap};
use crate::model::{Chapter, ContentUnit, FlatNavigationEntry, Navigation, UNTITLED_CHAPTER};
use crate::workspace::{sanitize_file_name, write_bytes_atomic};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Write every embedded image to `images_dir` and map archive references to
/// the exported files.
pub fn export_images(container: &dyn Container, images_dir: &Path) -> Result<ImageMap, PipelineError> {
    let mut map = ImageMap::new();
    let mut used_names: HashSet<String> = HashSet::new();

    for image in container.images() {
        let bytes = match container.read(&image.path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Skipping image {}: {}", image.path, e);
                continue;
            }
        };
        let mut name = sanitize_file_name(file_name(&image.path));
        if !used_names.insert(name.clone()) {
            name = format!("{}_{}", sanitize_file_name(&image.id), name);
            used_names.insert(name.clone());
        }
        let local = images_dir.join(&name);
        write_bytes_atomic(&local, &bytes)?;
        map.insert(&image.id, &image.path, local.to_string_lossy());
    }
    debug!("Exported {} images to {}", map.len(), images_dir.display());
    Ok(map)
}

/// Build the chapter list for `navigation`.
pub fn extract_chapters(
    container: &dyn Container,
    navigation: &Navigation,
    selection: &ChapterSelection,
    images: &ImageMap,
) -> Vec<Chapter> {
    let mut markup = MarkupCache::new(container);
    let chapters = if navigation.source.is_structured() {
        navigation_plan(&mut markup, &navigation.flatten(), selection, images)
    } else {
        per_file_plan(&mut markup, navigation, selection, images)
    };

    let (kept, empty): (Vec<Chapter>, Vec<Chapter>) =
        chapters.into_iter().partition(|c| !c.units.is_empty());
    for chapter in &empty {
        debug!("Chapter {} ({}) has no content, dropped", chapter.id, chapter.title);
    }
    info!(
        "Extracted {} chapters ({} units)",
        kept.len(),
        kept.iter().map(|c| c.units.len()).sum::<usize>()
    );
    kept
}

fn navigation_plan(
    markup: &mut MarkupCache<'_>,
    entries: &[FlatNavigationEntry],
    selection: &ChapterSelection,
    images: &ImageMap,
) -> Vec<Chapter> {
    // Anchors per file, across all entries, for fragment boundaries.
    let mut anchors: HashMap<&str, HashSet<String>> = HashMap::new();
    for entry in entries {
        if let Some(frag) = &entry.fragment_id {
            anchors
                .entry(entry.source_file.as_str())
                .or_default()
                .insert(frag.clone());
        }
    }

    let mut taken_whole: HashSet<String> = HashSet::new();
    let mut chapters = Vec::new();

    for entry in entries.iter().filter(|e| selection.includes(&e.id)) {
        if taken_whole.contains(&entry.source_file) {
            debug!("Skipping {}: {} already extracted", entry.id, entry.source_file);
            continue;
        }
        let Some(text) = markup.get(&entry.source_file) else {
            continue;
        };

        let units = match &entry.fragment_id {
            Some(frag) => {
                let mut others = anchors.get(entry.source_file.as_str()).cloned().unwrap_or_default();
                others.remove(frag);
                match extract_fragment_units(text, &entry.source_file, frag, &others, images) {
                    Some(units) => units,
                    None => {
                        warn!(
                            "Anchor #{} not found in {}, using the whole file",
                            frag, entry.source_file
                        );
                        taken_whole.insert(entry.source_file.clone());
                        extract_units(text, &entry.source_file, images)
                    }
                }
            }
            None => {
                taken_whole.insert(entry.source_file.clone());
                extract_units(text, &entry.source_file, images)
            }
        };

        chapters.push(Chapter {
            id: entry.id.clone(),
            title: entry.title.clone(),
            source_file: entry.source_file.clone(),
            fragment_id: entry.fragment_id.clone(),
            units,
            segments: Vec::new(),
            video: None,
        });
    }
    chapters
}

fn per_file_plan(
    markup: &mut MarkupCache<'_>,
    navigation: &Navigation,
    selection: &ChapterSelection,
    images: &ImageMap,
) -> Vec<Chapter> {
    let mut chapters = Vec::new();
    for node in navigation.roots.iter().filter(|n| selection.includes(&n.id)) {
        let name = file_name(&node.source_file).to_lowercase();
        if (name.contains("cover") || name.contains("toc")) && !selection.names(&node.id) {
            debug!("Skipping front matter {}", node.source_file);
            continue;
        }
        let Some(text) = markup.get(&node.source_file) else {
            continue;
        };
        let title = chapter_title(text).unwrap_or_else(|| UNTITLED_CHAPTER.to_string());
        let units: Vec<ContentUnit> = extract_units(text, &node.source_file, images);
        chapters.push(Chapter {
            id: node.id.clone(),
            title,
            source_file: node.source_file.clone(),
            fragment_id: None,
            units,
            segments: Vec::new(),
            video: None,
        });
    }
    chapters
}

/// Decoded content documents, read once each.
struct MarkupCache<'c> {
    container: &'c dyn Container,
    files: HashMap<String, Option<String>>,
}

impl<'c> MarkupCache<'c> {
    fn new(container: &'c dyn Container) -> Self {
        Self {
            container,
            files: HashMap::new(),
        }
    }

    fn get(&mut self, path: &str) -> Option<&str> {
        let container = self.container;
        self.files
            .entry(path.to_string())
            .or_insert_with(|| match container.read(path) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    warn!("Cannot read {}: {}", path, e);
                    None
                }
            })
            .as_deref()
    }
}
