//! Book index and cache maintenance.
//!
//! The index maps a stable document identifier (canonical input path or URL)
//! to the scope that narrates it, so a restarted process finds the same scope
//! and therefore the same checkpoint.

use super::{CacheStore, FsStore, NamespaceStats};
use crate::error::PipelineError;
use crate::workspace::{write_json_atomic, Workspace};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub scope_id: String,
    pub title: String,
    pub last_accessed: DateTime<Utc>,
    pub scope_dir: PathBuf,
}

/// `document id → scope` mapping stored at `<data_dir>/cache/index.json`.
#[derive(Debug, Clone, Default)]
pub struct BookIndex {
    path: PathBuf,
    entries: BTreeMap<String, IndexEntry>,
}

impl BookIndex {
    /// Load the index. A missing or unreadable file is an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!("Book index {} is corrupt, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Book index {} unreadable, starting empty: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn save(&self) -> Result<(), PipelineError> {
        write_json_atomic(&self.path, &self.entries)
    }

    pub fn get(&self, document_id: &str) -> Option<&IndexEntry> {
        self.entries.get(document_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, document_id: impl Into<String>, entry: IndexEntry) {
        self.entries.insert(document_id.into(), entry);
    }

    /// Refresh `last_accessed`; returns `false` for an unknown document.
    pub fn touch(&mut self, document_id: &str) -> bool {
        match self.entries.get_mut(document_id) {
            Some(entry) => {
                entry.last_accessed = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove every document mapped to `scope_id`; returns how many.
    pub fn remove_scope(&mut self, scope_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.scope_id != scope_id);
        before - self.entries.len()
    }

    /// Scope ids last accessed before `cutoff`.
    pub fn scopes_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.last_accessed < cutoff)
            .map(|e| e.scope_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Summary returned by [`cache_stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub books: usize,
    pub namespaces: Vec<NamespaceStats>,
}

/// Remove one scope: its directory and every index entry pointing at it.
pub fn clean_scope(workspace: &Workspace, scope_id: &str) -> Result<(), PipelineError> {
    let mut index = BookIndex::load(workspace.index_path());
    remove_scope_dir(workspace.scope(scope_id).root())?;
    let removed = index.remove_scope(scope_id);
    index.save()?;
    info!("Removed scope {} ({} index entries)", scope_id, removed);
    Ok(())
}

/// Remove scopes not accessed in `max_age_days`. Returns how many.
pub fn clean_expired(workspace: &Workspace, max_age_days: u32) -> Result<usize, PipelineError> {
    let mut index = BookIndex::load(workspace.index_path());
    let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
    let expired = index.scopes_older_than(cutoff);
    for scope_id in &expired {
        remove_scope_dir(workspace.scope(scope_id).root())?;
        index.remove_scope(scope_id);
    }
    index.save()?;
    info!("Removed {} expired scopes (older than {} days)", expired.len(), max_age_days);
    Ok(expired.len())
}

/// Number of indexed books and the size of the global tier.
pub async fn cache_stats(workspace: &Workspace) -> Result<CacheStats, PipelineError> {
    let index = BookIndex::load(workspace.index_path());
    let namespaces = FsStore::new(workspace.clone())
        .stats()
        .await
        .map_err(|e| PipelineError::Internal(e.to_string()))?;
    Ok(CacheStats {
        books: index.len(),
        namespaces,
    })
}

fn remove_scope_dir(dir: &Path) -> Result<(), PipelineError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::write(dir, e)),
    }
}
