//! Markup extraction: XHTML content documents → ordered text and image units.
//!
//! Blocks are `p`, `div` and `img`, taken in document order. A `div` that
//! wraps other blocks is passed through so its text is not emitted twice, and
//! empty blocks are skipped. Images embedded in a text block are emitted just
//! before that block's text; a standalone `img` is its own unit.
//!
//! Unit ids are `p_<index>` by block position in the document, embedded images
//! `p_<index>_img`, `p_<index>_img_1`, ...

use crate::container::{file_name, resolve_href};
use crate::model::ContentUnit;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::collections::{HashMap, HashSet};

static SEL_BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static SEL_CHAPTER_HEADINGS: Lazy<[Selector; 4]> =
    Lazy::new(|| ["h1", "h2", "h3", "h4"].map(|t| Selector::parse(t).unwrap()));

/// How far up from a fragment anchor to look for its enclosing section.
const SECTION_SEARCH_DEPTH: usize = 5;

const SKIPPED_ELEMENTS: &[&str] = &["head", "script", "style", "noscript"];

/// Maps archive image paths to the locations they were exported to.
#[derive(Debug, Clone, Default)]
pub struct ImageMap {
    by_path: HashMap<String, String>,
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl ImageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str, archive_path: &str, local_path: impl Into<String>) {
        let local = local_path.into();
        self.by_id.insert(id.to_string(), local.clone());
        self.by_name
            .entry(file_name(archive_path).to_string())
            .or_insert_with(|| local.clone());
        self.by_path.insert(archive_path.to_string(), local);
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Resolve an `img src` found in `markup_path`.
    ///
    /// Tries the resolved archive path, then the manifest id, then the bare
    /// file name; an unknown reference is returned verbatim.
    pub fn resolve(&self, markup_path: &str, src: &str) -> String {
        let archive = resolve_href(markup_path, src);
        self.by_path
            .get(&archive)
            .or_else(|| self.by_id.get(src))
            .or_else(|| self.by_name.get(file_name(&archive)))
            .cloned()
            .unwrap_or_else(|| src.to_string())
    }
}

/// Extract every unit of a whole content document.
pub fn extract_units(markup: &str, markup_path: &str, images: &ImageMap) -> Vec<ContentUnit> {
    let doc = Html::parse_document(markup);
    let root = doc.select(&SEL_BODY).next().unwrap_or_else(|| doc.root_element());
    Walker::new(markup_path, images).run(&[root])
}

/// Extract the units belonging to the anchor `fragment`.
///
/// The content is the nearest enclosing `section`, `div` or `article` (or an
/// element classed `chapter`/`section`) within a few levels of the anchor.
/// Without one, it is the anchor plus its following siblings up to the next
/// sibling carrying one of `other_anchors`. Returns `None` if the anchor does
/// not exist.
pub fn extract_fragment_units(
    markup: &str,
    markup_path: &str,
    fragment: &str,
    other_anchors: &HashSet<String>,
    images: &ImageMap,
) -> Option<Vec<ContentUnit>> {
    let doc = Html::parse_document(markup);
    let anchor = doc
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().id() == Some(fragment))?;

    let mut cursor = Some(anchor);
    for _ in 0..SECTION_SEARCH_DEPTH {
        let Some(el) = cursor else { break };
        if is_section(el) {
            return Some(Walker::new(markup_path, images).run(&[el]));
        }
        cursor = el.parent().and_then(ElementRef::wrap);
    }

    let mut roots = vec![anchor];
    for sibling in anchor.next_siblings().filter_map(ElementRef::wrap) {
        if carries_anchor(sibling, other_anchors) {
            break;
        }
        roots.push(sibling);
    }
    Some(Walker::new(markup_path, images).run(&roots))
}

/// Chapter title from the first non-empty `h1`–`h4`.
pub fn chapter_title(markup: &str) -> Option<String> {
    let doc = Html::parse_document(markup);
    SEL_CHAPTER_HEADINGS
        .iter()
        .find_map(|sel| doc.select(sel).map(collapse_text).find(|t| !t.is_empty()))
}

fn is_section(el: ElementRef<'_>) -> bool {
    matches!(el.value().name(), "section" | "div" | "article")
        || el.value().classes().any(|c| c == "chapter" || c == "section")
}

fn carries_anchor(el: ElementRef<'_>, anchors: &HashSet<String>) -> bool {
    std::iter::once(el)
        .chain(el.descendants().filter_map(ElementRef::wrap))
        .any(|e| e.value().id().is_some_and(|id| anchors.contains(id)))
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn is_block(el: ElementRef<'_>) -> bool {
    matches!(el.value().name(), "p" | "div")
}

/// Pre-order block walker over one or more subtrees.
struct Walker<'m> {
    markup_path: &'m str,
    images: &'m ImageMap,
    units: Vec<ContentUnit>,
    index: usize,
}

impl<'m> Walker<'m> {
    fn new(markup_path: &'m str, images: &'m ImageMap) -> Self {
        Self {
            markup_path,
            images,
            units: Vec::new(),
            index: 0,
        }
    }

    fn run(mut self, roots: &[ElementRef<'_>]) -> Vec<ContentUnit> {
        let mut stack: Vec<ElementRef<'_>> = roots.iter().rev().copied().collect();

        while let Some(el) = stack.pop() {
            let name = el.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            if name == "img" {
                if let Some(src) = image_src(el) {
                    let id = format!("p_{}", self.index);
                    self.push_image(id, src);
                    self.index += 1;
                }
                continue;
            }
            if is_block(el) && !(name == "div" && wraps_blocks(el)) {
                let text = collapse_text(el);
                if !text.is_empty() {
                    self.push_block(el, text);
                    continue;
                }
            }
            let mut kids: Vec<ElementRef<'_>> = el.children().filter_map(ElementRef::wrap).collect();
            kids.reverse();
            stack.extend(kids);
        }
        self.units
    }

    fn push_block(&mut self, el: ElementRef<'_>, text: String) {
        let base = format!("p_{}", self.index);
        let embedded: Vec<&str> = el
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|e| e.value().name() == "img")
            .filter_map(image_src)
            .collect();
        for (n, src) in embedded.into_iter().enumerate() {
            let id = if n == 0 {
                format!("{base}_img")
            } else {
                format!("{base}_img_{n}")
            };
            self.push_image(id, src);
        }
        self.units.push(ContentUnit::Text { id: base, content: text });
        self.index += 1;
    }

    fn push_image(&mut self, id: String, src: &str) {
        self.units.push(ContentUnit::Image {
            id,
            image_path: self.images.resolve(self.markup_path, src),
        });
    }
}

fn image_src<'a>(el: ElementRef<'a>) -> Option<&'a str> {
    el.value()
        .attr("src")
        .or_else(|| el.value().attr("xlink:href"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn wraps_blocks(el: ElementRef<'_>) -> bool {
    el.descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .any(is_block)
}
