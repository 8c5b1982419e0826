//! On-disk layout of the data directory and small file helpers.
//!
//! ```text
//! <data_dir>/cache/index.json                 book → scope mapping
//! <data_dir>/cache/global/<ns>/<key>.json     global cache tier
//! <data_dir>/scopes/<scope>/                  one directory per book run
//!     checkpoint.json, stages/                checkpoint + stage outputs
//!     cache/<ns>/<key>.json                   scope-local cache tier
//!     images/ audio/ pages/ videos/           stage artefacts
//! <output_dir>/<scope>_<title>/               final media
//! ```

use crate::error::PipelineError;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolved paths for a data directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let output_dir = output_dir.unwrap_or_else(|| data_dir.join("outputs"));
        Self { data_dir, output_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_dir().join("index.json")
    }

    pub fn global_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("global")
    }

    pub fn scopes_dir(&self) -> PathBuf {
        self.data_dir.join("scopes")
    }

    pub fn scope(&self, scope_id: &str) -> ScopeDirs {
        ScopeDirs {
            root: self.scopes_dir().join(scope_id),
        }
    }

    /// Directory holding the final media of one book.
    pub fn book_output_dir(&self, scope_id: &str, title: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}", scope_id, sanitize_file_name(title)))
    }
}

/// Paths inside one scope directory.
#[derive(Debug, Clone)]
pub struct ScopeDirs {
    root: PathBuf,
}

impl ScopeDirs {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn audio(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn pages(&self) -> PathBuf {
        self.root.join("pages")
    }

    pub fn videos(&self) -> PathBuf {
        self.root.join("videos")
    }
}

/// Generate a new scope id: the first 8 hex chars of a v4 UUID.
pub fn new_scope_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Make `name` safe to use as a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned.chars().take(80).collect()
    }
}

/// Serialise `value` as pretty JSON and atomically replace `path` with it.
///
/// The data goes to a temp file in the same directory which is then renamed
/// over the target, so readers never observe a partial file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("serialise {}: {e}", path.display())))?;
    write_bytes_atomic(path, &bytes)
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| PipelineError::write(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::write(path, e))?;
    tmp.write_all(bytes).map_err(|e| PipelineError::write(path, e))?;
    tmp.persist(path).map_err(|e| PipelineError::write(path, e.error))?;
    Ok(())
}

/// Run filesystem work on the blocking pool so it never stalls the runtime's
/// worker threads.
pub async fn blocking<T, F>(work: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Internal(format!("blocking file task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn output_dir_defaults_under_data_dir() {
        let ws = Workspace::new("/tmp/data", None);
        assert_eq!(ws.output_dir(), Path::new("/tmp/data/outputs"));
        assert_eq!(ws.index_path(), Path::new("/tmp/data/cache/index.json"));
        assert_eq!(
            ws.scope("ab12cd34").audio(),
            Path::new("/tmp/data/scopes/ab12cd34/audio")
        );
    }

    #[test]
    fn scope_ids_are_short_hex() {
        let id = new_scope_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_scope_id());
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_file_name("A/B: C?"), "A_B_ C_");
        assert_eq!(sanitize_file_name("  ..  "), "untitled");
        assert_eq!(sanitize_file_name("第一章"), "第一章");
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(v["v"], 2);
    }

    #[tokio::test]
    async fn blocking_work_returns_its_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x/y.json");
        let target = path.clone();
        blocking(move || write_json_atomic(&target, &serde_json::json!([1, 2]))).await.unwrap();
        assert!(path.exists());

        let err = blocking(|| Err::<(), _>(PipelineError::Internal("nope".into()))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(ref m) if m == "nope"));
    }

    #[tokio::test]
    async fn panicking_blocking_work_is_an_internal_error() {
        let err = blocking(|| -> Result<(), PipelineError> { panic!("disk on fire") })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Internal(ref m) if m.contains("blocking file task failed")));
    }
}
