//! Navigation resolution: one canonical table-of-contents tree from whichever
//! navigation format a book provides.
//!
//! ## Strategy order
//!
//! 1. **Navigation map** (NCX): `navPoint` elements, nested.
//! 2. **Navigation document** (EPUB 3 `<nav epub:type="toc">`): nested `<ol>`.
//! 3. **Spine**: one entry per content document in reading order.
//!
//! Any failure inside strategy 1 or 2 (unreadable resource, no nav root, a
//! node without a content reference, zero entries) falls through to the next
//! one with a warning; resolution never fails, the spine is always there.
//!
//! ## Why explicit stacks?
//!
//! Navigation files come from arbitrary publishing tools. Trees are walked
//! with an explicit work stack and a depth cap rather than recursion, and each
//! node's id is checked against its ancestors so a node can never become its
//! own descendant. Nodes are collected into an arena with parent indices and
//! assembled into the owned tree at the end.
//!
//! Both XML formats are read with the HTML parser from `scraper`, which
//! lowercases tag names and does not honour `<content/>` self-closing syntax.
//! Child `navpoint`s may therefore end up nested inside `content`; children are
//! found as the nearest `navpoint` descendants rather than direct children.

use crate::container::{resolve_href, split_fragment, Container, NavKind};
use crate::model::{Navigation, NavigationNode, NavigationSource, UNTITLED_CHAPTER};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Default cap on tree depth.
pub const DEFAULT_MAX_DEPTH: usize = 32;

static SEL_NAVMAP: Lazy<Selector> = Lazy::new(|| Selector::parse("navmap").unwrap());
static SEL_NAV: Lazy<Selector> = Lazy::new(|| Selector::parse("nav").unwrap());
static SEL_OL: Lazy<Selector> = Lazy::new(|| Selector::parse("ol").unwrap());
static SEL_TITLE_TAGS: Lazy<[Selector; 4]> = Lazy::new(|| {
    ["h1", "h2", "h3", "title"].map(|t| Selector::parse(t).unwrap())
});

/// Why a strategy gave up.
#[derive(Debug)]
struct Fallthrough(String);

/// Builds a [`Navigation`] from a [`Container`].
#[derive(Debug, Clone, Copy)]
pub struct NavigationResolver {
    max_depth: usize,
}

impl Default for NavigationResolver {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl NavigationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    /// Resolve the navigation tree, trying each strategy in priority order.
    pub fn resolve(&self, container: &dyn Container) -> Navigation {
        for resource in container.navigation_resources() {
            let markup = match container.read(&resource.path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!("Navigation resource unreadable, trying next strategy: {}", e);
                    continue;
                }
            };
            let (source, parsed) = match resource.kind {
                NavKind::Map => (
                    NavigationSource::NavigationMap,
                    self.parse_navigation_map(&markup, &resource.path),
                ),
                NavKind::Document => (
                    NavigationSource::NavigationDocument,
                    self.parse_navigation_document(&markup, &resource.path),
                ),
            };
            match parsed {
                Ok(roots) => {
                    let navigation = Navigation { source, roots };
                    info!(
                        "Navigation from {} ({:?}): {} entries",
                        resource.path,
                        source,
                        navigation.node_count()
                    );
                    return navigation;
                }
                Err(Fallthrough(reason)) => {
                    warn!("Navigation {} unusable ({}), trying next strategy", resource.path, reason);
                }
            }
        }

        let roots = spine_navigation(container);
        info!("Navigation synthesised from spine: {} entries", roots.len());
        Navigation {
            source: NavigationSource::Spine,
            roots,
        }
    }

    // ── Strategy 1: navigation map ───────────────────────────────────────

    fn parse_navigation_map(&self, xml: &str, nav_path: &str) -> Result<Vec<NavigationNode>, Fallthrough> {
        let doc = Html::parse_document(xml);
        let nav_map = doc
            .select(&SEL_NAVMAP)
            .next()
            .ok_or_else(|| Fallthrough("no navMap element".into()))?;

        let mut tree = TreeBuilder::default();
        let (_, top) = scan_until(nav_map, "navpoint");
        let mut stack: Vec<(ElementRef, Option<usize>, usize)> =
            top.into_iter().rev().map(|el| (el, None, 0)).collect();

        while let Some((point, parent, level)) = stack.pop() {
            if level >= self.max_depth {
                warn!("Navigation map deeper than {} levels, subtree dropped", self.max_depth);
                continue;
            }
            let (own, children) = scan_until(point, "navpoint");

            let title = own
                .iter()
                .find(|el| el.value().name() == "text")
                .map(|el| collapse_text(*el))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| UNTITLED_CHAPTER.to_string());
            let src = own
                .iter()
                .filter(|el| el.value().name() == "content")
                .find_map(|el| el.value().attr("src"))
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| Fallthrough(format!("navPoint '{title}' has no content src")))?;
            let (source_file, fragment_id) = resolve_reference(nav_path, src.trim());
            let raw_id = point.value().attr("id").map(str::trim).filter(|id| !id.is_empty());

            let Some(idx) = tree.push(raw_id, title, level, source_file, fragment_id, parent) else {
                continue;
            };
            stack.extend(children.into_iter().rev().map(|el| (el, Some(idx), level + 1)));
        }

        if tree.is_empty() {
            return Err(Fallthrough("navMap has no navPoint entries".into()));
        }
        Ok(tree.into_roots())
    }

    // ── Strategy 2: navigation document ──────────────────────────────────

    fn parse_navigation_document(&self, markup: &str, nav_path: &str) -> Result<Vec<NavigationNode>, Fallthrough> {
        let doc = Html::parse_document(markup);
        let nav = doc
            .select(&SEL_NAV)
            .find(|el| {
                el.value()
                    .attr("epub:type")
                    .is_some_and(|t| t.split_whitespace().any(|t| t == "toc"))
            })
            .or_else(|| doc.select(&SEL_NAV).next())
            .ok_or_else(|| Fallthrough("no nav element".into()))?;
        let list = nav
            .select(&SEL_OL)
            .next()
            .ok_or_else(|| Fallthrough("nav element has no ol".into()))?;

        let mut tree = TreeBuilder::default();
        let mut stack: Vec<(ElementRef, Option<usize>, usize)> =
            list_items(list).into_iter().rev().map(|li| (li, None, 0)).collect();

        while let Some((item, parent, level)) = stack.pop() {
            if level >= self.max_depth {
                warn!("Navigation document deeper than {} levels, subtree dropped", self.max_depth);
                continue;
            }
            let (own, nested) = scan_until(item, "ol");
            let anchor = own
                .iter()
                .find(|el| el.value().name() == "a" && el.value().attr("href").is_some_and(|h| !h.trim().is_empty()));

            // An item without a link only groups its children; they take its place.
            let (child_parent, child_level) = match anchor {
                Some(a) => {
                    let href = a.value().attr("href").unwrap_or_default().trim();
                    let title = Some(collapse_text(*a))
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| UNTITLED_CHAPTER.to_string());
                    let (source_file, fragment_id) = resolve_reference(nav_path, href);
                    let id = format!("nav_{}", tree.len());
                    match tree.push(Some(id.as_str()), title, level, source_file, fragment_id, parent) {
                        Some(idx) => (Some(idx), level + 1),
                        None => continue,
                    }
                }
                None => {
                    debug!("Navigation item without link, promoting its children");
                    (parent, level)
                }
            };

            let children: Vec<ElementRef> = nested.into_iter().flat_map(list_items).collect();
            stack.extend(children.into_iter().rev().map(|li| (li, child_parent, child_level)));
        }

        if tree.is_empty() {
            return Err(Fallthrough("nav list has no linked entries".into()));
        }
        Ok(tree.into_roots())
    }
}

// ── Strategy 3: spine ────────────────────────────────────────────────────

fn spine_navigation(container: &dyn Container) -> Vec<NavigationNode> {
    container
        .spine()
        .into_iter()
        .enumerate()
        .map(|(i, path)| {
            let title = container
                .read(&path)
                .ok()
                .and_then(|bytes| first_heading(&String::from_utf8_lossy(&bytes)))
                .unwrap_or_else(|| format!("Chapter {}", i + 1));
            NavigationNode {
                id: format!("spine_{i}"),
                title,
                level: 0,
                source_file: path,
                fragment_id: None,
                children: Vec::new(),
            }
        })
        .collect()
}

/// Text of the first non-empty `h1`, `h2`, `h3` or `title`, in that priority.
pub fn first_heading(markup: &str) -> Option<String> {
    let doc = Html::parse_document(markup);
    SEL_TITLE_TAGS.iter().find_map(|sel| {
        doc.select(sel)
            .map(collapse_text)
            .find(|t| !t.is_empty())
    })
}

// ── Tree assembly ────────────────────────────────────────────────────────

struct ArenaNode {
    parent: Option<usize>,
    node: NavigationNode,
}

/// Collects nodes in pre-order with parent links, then assembles the tree.
#[derive(Default)]
struct TreeBuilder {
    arena: Vec<ArenaNode>,
    ids: HashSet<String>,
}

impl TreeBuilder {
    fn len(&self) -> usize {
        self.arena.len()
    }

    fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Add a node. Returns `None` when the node would repeat an ancestor's id.
    fn push(
        &mut self,
        id: Option<&str>,
        title: String,
        level: usize,
        source_file: String,
        fragment_id: Option<String>,
        parent: Option<usize>,
    ) -> Option<usize> {
        let id = match id {
            Some(id) if self.is_ancestor_id(parent, id) => {
                warn!("Navigation entry '{}' repeats an ancestor id, dropped", id);
                return None;
            }
            Some(id) if !self.ids.contains(id) => id.to_string(),
            Some(id) => self.unique_id(id),
            None => self.unique_id("navpoint"),
        };
        self.ids.insert(id.clone());
        self.arena.push(ArenaNode {
            parent,
            node: NavigationNode {
                id,
                title,
                level,
                source_file,
                fragment_id,
                children: Vec::new(),
            },
        });
        Some(self.arena.len() - 1)
    }

    fn is_ancestor_id(&self, mut cursor: Option<usize>, id: &str) -> bool {
        while let Some(idx) = cursor {
            let entry = &self.arena[idx];
            if entry.node.id == id {
                return true;
            }
            cursor = entry.parent;
        }
        false
    }

    fn unique_id(&self, base: &str) -> String {
        (self.arena.len()..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.ids.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Children always sit after their parent in the arena, so walking it
    /// backwards completes every node before it is moved into its parent.
    fn into_roots(self) -> Vec<NavigationNode> {
        let mut slots: Vec<(Option<usize>, Option<NavigationNode>)> =
            self.arena.into_iter().map(|a| (a.parent, Some(a.node))).collect();
        let mut roots = Vec::new();

        for idx in (0..slots.len()).rev() {
            let (parent, node) = &mut slots[idx];
            let parent = *parent;
            let Some(mut node) = node.take() else { continue };
            node.children.reverse();
            match parent {
                Some(p) => {
                    if let Some(parent_node) = slots[p].1.as_mut() {
                        parent_node.children.push(node);
                    }
                }
                None => roots.push(node),
            }
        }
        roots.reverse();
        roots
    }
}

// ── Markup helpers ───────────────────────────────────────────────────────

/// Walk the descendants of `root` in document order, stopping at elements
/// named `stop`. Returns the elements passed through and the `stop`
/// elements reached.
fn scan_until<'a>(root: ElementRef<'a>, stop: &str) -> (Vec<ElementRef<'a>>, Vec<ElementRef<'a>>) {
    let mut own = Vec::new();
    let mut reached = Vec::new();
    let mut stack: Vec<ElementRef<'a>> = root.children().filter_map(ElementRef::wrap).collect();
    stack.reverse();

    while let Some(el) = stack.pop() {
        if el.value().name() == stop {
            reached.push(el);
            continue;
        }
        own.push(el);
        let mut kids: Vec<ElementRef<'a>> = el.children().filter_map(ElementRef::wrap).collect();
        kids.reverse();
        stack.extend(kids);
    }
    (own, reached)
}

fn list_items(list: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    list.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "li")
        .collect()
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Resolve an href found in `nav_path` into `(source_file, fragment)`.
fn resolve_reference(nav_path: &str, href: &str) -> (String, Option<String>) {
    let (path, fragment) = split_fragment(href);
    let source = if path.is_empty() {
        nav_path.to_string()
    } else {
        resolve_href(nav_path, path)
    };
    (source, fragment.map(str::to_string))
}
