//! Cache storage backends.

use super::{CacheEntry, CacheStore, NamespaceStats, Tier};
use crate::error::CacheError;
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// JSON files under the data directory.
///
/// ```text
/// <data_dir>/cache/global/<ns>/<key>.json
/// <data_dir>/scopes/<scope>/cache/<ns>/<key>.json
/// ```
///
/// Attachments sit next to their entry as `<key>.<ext>`. Every file is
/// written under a unique temporary name and renamed into place.
#[derive(Debug, Clone)]
pub struct FsStore {
    workspace: Workspace,
}

impl FsStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn namespace_dir(&self, tier: &Tier, namespace: &str) -> PathBuf {
        match tier {
            Tier::Global => self.workspace.global_cache_dir().join(namespace),
            Tier::Scope(id) => self.workspace.scope(id).cache().join(namespace),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()))
}

async fn commit(tmp: PathBuf, path: &Path, written: std::io::Result<()>) -> Result<(), CacheError> {
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(path)(e));
    }
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))
}

/// Write `bytes` to a uniquely named sibling, then rename over `path`.
async fn replace_with_bytes(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = temp_sibling(path);
    let written = tokio::fs::write(&tmp, bytes).await;
    commit(tmp, path, written).await
}

/// Copy `src` to a uniquely named sibling, then rename over `path`.
async fn replace_with_copy(path: &Path, src: &Path) -> Result<(), CacheError> {
    let tmp = temp_sibling(path);
    let written = tokio::fs::copy(src, &tmp).await.map(|_| ());
    commit(tmp, path, written).await
}

#[async_trait]
impl CacheStore for FsStore {
    async fn get(&self, tier: &Tier, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.namespace_dir(tier, namespace).join(format!("{key}.json"));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let entry: CacheEntry = serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            detail: e.to_string(),
        })?;
        // An entry whose artefact vanished is useless.
        if let Some(attachment) = &entry.attachment {
            if !tokio::fs::try_exists(attachment).await.unwrap_or(false) {
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    async fn put(&self, tier: &Tier, namespace: &str, mut entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        let dir = self.namespace_dir(tier, namespace);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        if let Some(src) = entry.attachment.take() {
            let ext = src.extension().and_then(|e| e.to_str()).unwrap_or("bin");
            let dest = dir.join(format!("{}.{}", entry.key, ext));
            if dest != src {
                replace_with_copy(&dest, &src).await?;
            }
            entry.attachment = Some(dest);
        }

        let path = dir.join(format!("{}.json", entry.key));
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|e| CacheError::Corrupt {
            key: entry.key.clone(),
            detail: e.to_string(),
        })?;
        replace_with_bytes(&path, &bytes).await?;
        Ok(entry)
    }

    async fn purge_scope(&self, scope_id: &str) -> Result<(), CacheError> {
        let dir = self.workspace.scope(scope_id).cache();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    async fn stats(&self) -> Result<Vec<NamespaceStats>, CacheError> {
        let root = self.workspace.global_cache_dir();
        let mut out = Vec::new();
        let mut namespaces = match tokio::fs::read_dir(&root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err(&root)(e)),
        };
        while let Some(ns) = namespaces.next_entry().await.map_err(io_err(&root))? {
            let ns_path = ns.path();
            if !ns_path.is_dir() {
                continue;
            }
            let mut stats = NamespaceStats {
                namespace: ns.file_name().to_string_lossy().into_owned(),
                ..NamespaceStats::default()
            };
            let mut files = tokio::fs::read_dir(&ns_path).await.map_err(io_err(&ns_path))?;
            while let Some(file) = files.next_entry().await.map_err(io_err(&ns_path))? {
                let meta = file.metadata().await.map_err(io_err(&ns_path))?;
                if !meta.is_file() {
                    continue;
                }
                if file.path().extension().is_some_and(|e| e == "json") {
                    stats.entries += 1;
                }
                stats.bytes += meta.len();
            }
            out.push(stats);
        }
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(out)
    }
}

/// Entries in a process-local map. Attachments are referenced, not copied.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(Tier, String, String), CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(Tier, String, String), CacheEntry>>, CacheError> {
        self.entries.lock().map_err(|e| CacheError::Corrupt {
            key: "<memory store>".into(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, tier: &Tier, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let map = self.lock()?;
        Ok(map
            .get(&(tier.clone(), namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, tier: &Tier, namespace: &str, entry: CacheEntry) -> Result<CacheEntry, CacheError> {
        let mut map = self.lock()?;
        map.insert(
            (tier.clone(), namespace.to_string(), entry.key.clone()),
            entry.clone(),
        );
        Ok(entry)
    }

    async fn purge_scope(&self, scope_id: &str) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        map.retain(|(tier, _, _), _| !matches!(tier, Tier::Scope(id) if id == scope_id));
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<NamespaceStats>, CacheError> {
        let map = self.lock()?;
        let mut by_ns: HashMap<&str, usize> = HashMap::new();
        for (tier, ns, _) in map.keys() {
            if *tier == Tier::Global {
                *by_ns.entry(ns.as_str()).or_default() += 1;
            }
        }
        let mut out: Vec<NamespaceStats> = by_ns
            .into_iter()
            .map(|(ns, entries)| NamespaceStats {
                namespace: ns.to_string(),
                entries,
                bytes: 0,
            })
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            payload: json!({"k": key}),
            created_at: Utc::now(),
            owner_scope: None,
            attachment: None,
        }
    }

    #[tokio::test]
    async fn corrupt_entry_reports_error() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(Workspace::new(dir.path(), None));
        store.put(&Tier::Global, "rewrite", entry("a")).await.unwrap();
        let path = dir.path().join("cache/global/rewrite/a.json");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            store.get(&Tier::Global, "rewrite", "a").await,
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn purge_scope_leaves_global() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(Workspace::new(dir.path(), None));
        let scope = Tier::Scope("s1".into());
        store.put(&Tier::Global, "rewrite", entry("a")).await.unwrap();
        store.put(&scope, "rewrite", entry("a")).await.unwrap();
        store.purge_scope("s1").await.unwrap();
        assert!(store.get(&scope, "rewrite", "a").await.unwrap().is_none());
        assert!(store.get(&Tier::Global, "rewrite", "a").await.unwrap().is_some());
        store.purge_scope("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn stats_count_global_entries() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(Workspace::new(dir.path(), None));
        store.put(&Tier::Global, "rewrite", entry("a")).await.unwrap();
        store.put(&Tier::Global, "rewrite", entry("b")).await.unwrap();
        store.put(&Tier::Global, "speech", entry("c")).await.unwrap();
        store.put(&Tier::Scope("s".into()), "speech", entry("d")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].namespace, "rewrite");
        assert_eq!(stats[0].entries, 2);
        assert_eq!(stats[1].entries, 1);
        assert!(stats[0].bytes > 0);
    }

    #[tokio::test]
    async fn missing_attachment_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(Workspace::new(dir.path(), None));
        let audio = dir.path().join("x.wav");
        std::fs::write(&audio, b"RIFF").unwrap();
        let mut e = entry("a");
        e.attachment = Some(audio);
        let stored = store.put(&Tier::Global, "speech", e).await.unwrap();
        std::fs::remove_file(stored.attachment.unwrap()).unwrap();
        assert!(store.get(&Tier::Global, "speech", "a").await.unwrap().is_none());
    }
}
