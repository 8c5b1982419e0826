//! Two-tier content-addressable cache for expensive external calls.
//!
//! ## Why two tiers?
//!
//! The **global** tier is shared by every book: a rewrite or synthesis of the
//! same text is the same result no matter which book asked for it. The
//! **scope** tier holds a copy of every entry one book uses, so deleting that
//! book's directory cleans up after it without touching the global tier, and
//! tools that only look inside one scope find everything there.
//!
//! Lookups go global first, then scope. A global hit runs the
//! [`GlobalHitHook`] (by default [`CopyDown`], which materialises the entry
//! in the scope tier) so later stages never special-case where a hit came
//! from. Writes go to both tiers.
//!
//! Keys are content hashes, so a changed input is a different key: entries
//! are never invalidated, only looked up. Concurrent writers of one key write
//! equivalent payloads, and last-write-wins is fine.
//!
//! Storage is pluggable through [`CacheStore`]: [`FsStore`] keeps JSON files
//! under the data directory, [`MemoryStore`] keeps everything in a map.

mod index;
mod store;

pub use index::{cache_stats, clean_expired, clean_scope, BookIndex, CacheStats, IndexEntry};
pub use store::{FsStore, MemoryStore};

use crate::error::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace for rewritten narration text.
pub const NS_REWRITE: &str = "rewrite";
/// Namespace for synthesised speech.
pub const NS_SPEECH: &str = "speech";
/// Namespace for captured page videos.
pub const NS_CAPTURE: &str = "capture";

/// Which tier an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tier {
    Global,
    Scope(String),
}

/// One cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Stage-specific result.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Scope that produced the entry.
    pub owner_scope: Option<String>,
    /// Binary artefact stored next to the entry (e.g. an audio file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<PathBuf>,
}

/// Per-namespace size of the global tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub namespace: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Storage backend for cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, tier: &Tier, namespace: &str, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store `entry`, copying its attachment into the tier. Returns the entry
    /// as stored, with the attachment pointing at the tier's copy.
    async fn put(&self, tier: &Tier, namespace: &str, entry: CacheEntry) -> Result<CacheEntry, CacheError>;

    /// Drop every scope-tier entry of `scope_id`.
    async fn purge_scope(&self, scope_id: &str) -> Result<(), CacheError>;

    /// Sizes of the global tier by namespace.
    async fn stats(&self) -> Result<Vec<NamespaceStats>, CacheError>;
}

/// Runs after a global-tier hit.
#[async_trait]
pub trait GlobalHitHook: Send + Sync {
    /// Returns the entry the caller should use.
    async fn on_global_hit(
        &self,
        store: &dyn CacheStore,
        scope_id: &str,
        namespace: &str,
        entry: CacheEntry,
    ) -> Result<CacheEntry, CacheError>;
}

/// Materialise global hits into the scope tier.
pub struct CopyDown;

#[async_trait]
impl GlobalHitHook for CopyDown {
    async fn on_global_hit(
        &self,
        store: &dyn CacheStore,
        scope_id: &str,
        namespace: &str,
        entry: CacheEntry,
    ) -> Result<CacheEntry, CacheError> {
        store.put(&Tier::Scope(scope_id.to_string()), namespace, entry).await
    }
}

/// The cache as stages see it: one lookup, one store, both layered.
#[derive(Clone)]
pub struct PipelineCache {
    store: Arc<dyn CacheStore>,
    hook: Arc<dyn GlobalHitHook>,
    enabled: bool,
}

impl PipelineCache {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool) -> Self {
        Self {
            store,
            hook: Arc::new(CopyDown),
            enabled,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn GlobalHitHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn store_backend(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Find `key`, global tier first. Backend errors count as a miss.
    pub async fn lookup(&self, namespace: &str, key: &str, scope_id: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }

        match self.store.get(&Tier::Global, namespace, key).await {
            Ok(Some(entry)) => {
                debug!("cache hit (global) {}/{}", namespace, short(key));
                let fallback = entry.clone();
                return match self
                    .hook
                    .on_global_hit(self.store.as_ref(), scope_id, namespace, entry)
                    .await
                {
                    Ok(materialised) => Some(materialised),
                    Err(e) => {
                        warn!("cache copy-down failed for {}/{}: {}", namespace, short(key), e);
                        Some(fallback)
                    }
                };
            }
            Ok(None) => {}
            Err(e) => warn!("cache read failed (global) {}/{}: {}", namespace, short(key), e),
        }

        match self
            .store
            .get(&Tier::Scope(scope_id.to_string()), namespace, key)
            .await
        {
            Ok(Some(entry)) => {
                debug!("cache hit (scope {}) {}/{}", scope_id, namespace, short(key));
                Some(entry)
            }
            Ok(None) => {
                debug!("cache miss {}/{}", namespace, short(key));
                None
            }
            Err(e) => {
                warn!("cache read failed (scope {}) {}/{}: {}", scope_id, namespace, short(key), e);
                None
            }
        }
    }

    /// Write `payload` under `key` to both tiers.
    ///
    /// Returns the scope-tier entry, or `None` when the cache is disabled or
    /// the write failed (failures are logged, never raised).
    pub async fn store(
        &self,
        namespace: &str,
        key: &str,
        payload: serde_json::Value,
        scope_id: &str,
        attachment: Option<&Path>,
    ) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            created_at: Utc::now(),
            owner_scope: Some(scope_id.to_string()),
            attachment: attachment.map(Path::to_path_buf),
        };

        if let Err(e) = self.store.put(&Tier::Global, namespace, entry.clone()).await {
            warn!("cache write failed (global) {}/{}: {}", namespace, short(key), e);
        }
        match self
            .store
            .put(&Tier::Scope(scope_id.to_string()), namespace, entry)
            .await
        {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!("cache write failed (scope {}) {}/{}: {}", scope_id, namespace, short(key), e);
                None
            }
        }
    }
}

/// First twelve characters of `key`, for log lines.
fn short(key: &str) -> &str {
    key.char_indices().nth(12).map_or(key, |(i, _)| &key[..i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fs_cache(dir: &TempDir, enabled: bool) -> PipelineCache {
        let ws = crate::workspace::Workspace::new(dir.path(), None);
        PipelineCache::new(Arc::new(FsStore::new(ws)), enabled)
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = fs_cache(&dir, true);
        cache.store(NS_REWRITE, "k1", json!({"text": "hi"}), "scope1", None).await;
        let hit = cache.lookup(NS_REWRITE, "k1", "scope1").await.unwrap();
        assert_eq!(hit.payload, json!({"text": "hi"}));
        assert_eq!(hit.owner_scope.as_deref(), Some("scope1"));
        assert!(cache.lookup(NS_REWRITE, "k2", "scope1").await.is_none());
        assert!(cache.lookup(NS_SPEECH, "k1", "scope1").await.is_none());
    }

    #[tokio::test]
    async fn global_hit_is_copied_into_other_scope() {
        let dir = TempDir::new().unwrap();
        let cache = fs_cache(&dir, true);
        let store = cache.store_backend().clone();
        cache.store(NS_REWRITE, "k1", json!("v"), "book_a", None).await;

        let other = Tier::Scope("book_b".into());
        assert!(store.get(&other, NS_REWRITE, "k1").await.unwrap().is_none());
        let hit = cache.lookup(NS_REWRITE, "k1", "book_b").await.unwrap();
        assert_eq!(hit.payload, json!("v"));
        let local = store.get(&other, NS_REWRITE, "k1").await.unwrap().unwrap();
        assert_eq!(local.payload, json!("v"));
    }

    #[tokio::test]
    async fn scope_tier_answers_when_global_is_gone() {
        let dir = TempDir::new().unwrap();
        let cache = fs_cache(&dir, true);
        cache.store(NS_REWRITE, "k1", json!(1), "s", None).await;
        std::fs::remove_dir_all(dir.path().join("cache/global")).unwrap();
        assert_eq!(cache.lookup(NS_REWRITE, "k1", "s").await.unwrap().payload, json!(1));
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let dir = TempDir::new().unwrap();
        fs_cache(&dir, true).store(NS_REWRITE, "k1", json!(1), "s", None).await;
        let disabled = fs_cache(&dir, false);
        assert!(disabled.lookup(NS_REWRITE, "k1", "s").await.is_none());
        assert!(disabled.store(NS_REWRITE, "k2", json!(2), "s", None).await.is_none());
        assert!(fs_cache(&dir, true).lookup(NS_REWRITE, "k2", "s").await.is_none());
    }

    #[tokio::test]
    async fn attachments_follow_entries() {
        let dir = TempDir::new().unwrap();
        let cache = fs_cache(&dir, true);
        let audio = dir.path().join("clip.mp3");
        std::fs::write(&audio, b"ID3 fake audio").unwrap();

        let stored = cache
            .store(NS_SPEECH, "abc", json!({"duration": 1.5}), "s1", Some(&audio))
            .await
            .unwrap();
        let local = stored.attachment.unwrap();
        assert!(local.starts_with(dir.path().join("scopes/s1/cache/speech")));
        assert_eq!(std::fs::read(&local).unwrap(), b"ID3 fake audio");

        let hit = cache.lookup(NS_SPEECH, "abc", "s2").await.unwrap();
        let copied = hit.attachment.unwrap();
        assert!(copied.starts_with(dir.path().join("scopes/s2/cache/speech")));
        assert_eq!(std::fs::read(copied).unwrap(), b"ID3 fake audio");
    }

    #[tokio::test]
    async fn memory_store_behaves_like_fs() {
        let cache = PipelineCache::new(Arc::new(MemoryStore::default()), true);
        cache.store(NS_CAPTURE, "p", json!("video.mp4"), "a", None).await;
        assert!(cache.lookup(NS_CAPTURE, "p", "b").await.is_some());
        let local = cache
            .store_backend()
            .get(&Tier::Scope("b".into()), NS_CAPTURE, "p")
            .await
            .unwrap();
        assert!(local.is_some());
    }

    #[test]
    fn short_keys_cut_on_char_boundaries() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("ключ-ключ-ключ"), "ключ-ключ-кл");
        assert_eq!(short("第一章第二章"), "第一章第二章");
    }

    #[tokio::test]
    async fn non_ascii_keys_round_trip_with_logging_on() {
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).with_test_writer().finish(),
        );
        let cache = PipelineCache::new(Arc::new(MemoryStore::default()), true);
        let key = "ключ-ключ-ключ";
        assert!(cache.lookup(NS_REWRITE, key, "s").await.is_none());
        cache.store(NS_REWRITE, key, json!("v"), "s", None).await;
        assert_eq!(cache.lookup(NS_REWRITE, key, "s").await.unwrap().payload, json!("v"));
    }
}
