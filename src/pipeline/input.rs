//! Input resolution: normalise a user-supplied path or URL to a local file.
//!
//! ## Why download to a temp file?
//!
//! The EPUB reader needs a seekable file on disk. Downloading to a `TempDir`
//! gives it one while ensuring cleanup happens automatically when
//! [`ResolvedInput`] is dropped, even if the process panics. The ZIP magic
//! bytes (`PK\x03\x04`) are checked before returning so callers get a
//! meaningful error rather than an archive-reader failure.

use crate::error::PipelineError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// A local path, or a downloaded temp file kept alive by this guard.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local { path: PathBuf, document_id: String },
    /// Input was a URL; the book was downloaded to a temp directory.
    /// The `TempDir` is kept alive until processing completes.
    Downloaded {
        path: PathBuf,
        url: String,
        _temp_dir: TempDir,
    },
}

impl ResolvedInput {
    /// Path of the book file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local { path, .. } | ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// Stable identifier of the document: the canonical local path, or the
    /// URL for downloads.
    pub fn document_id(&self) -> &str {
        match self {
            ResolvedInput::Local { document_id, .. } => document_id,
            ResolvedInput::Downloaded { url, .. } => url,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local EPUB file.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, PipelineError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, PipelineError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(PipelineError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic).unwrap_or(0);
            if n < 4 || magic != ZIP_MAGIC {
                return Err(PipelineError::NotAnEpub { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound { path });
        }
    }

    let document_id = document_id(path_str);
    debug!("Resolved local book: {}", path.display());
    Ok(ResolvedInput::Local { path, document_id })
}

/// Stable identifier of `input` without opening or downloading it: the URL
/// itself, or the canonical path (the path as given if it cannot be
/// canonicalised).
pub fn document_id(input: &str) -> String {
    if is_url(input) {
        return input.to_string();
    }
    std::fs::canonicalize(input)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| input.to_string())
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, PipelineError> {
    info!("Downloading book from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(|e| PipelineError::DownloadFailed {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if bytes.len() < 4 || bytes[..4] != ZIP_MAGIC {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAnEpub {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::write(&file_path, e))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        url: url.to_string(),
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return crate::workspace::sanitize_file_name(last);
                }
            }
        }
    }
    "downloaded.epub".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/book.epub"));
        assert!(is_url("http://example.com/book.epub"));
        assert!(!is_url("/tmp/book.epub"));
        assert!(!is_url("book.epub"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_cases() {
        assert_eq!(filename_from_url("https://x.org/a/b/novel.epub"), "novel.epub");
        assert_eq!(filename_from_url("https://x.org/download"), "downloaded.epub");
        assert_eq!(filename_from_url("not a url"), "downloaded.epub");
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = resolve_input("/definitely/not/here.epub", 5).await.err().unwrap();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn wrong_magic_is_not_an_epub() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.epub");
        std::fs::write(&path, b"%PDF-1.7").unwrap();
        let err = resolve_input(path.to_str().unwrap(), 5).await.err().unwrap();
        match err {
            PipelineError::NotAnEpub { magic, .. } => assert_eq!(&magic, b"%PDF"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zip_file_resolves_with_canonical_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, b"PK\x03\x04rest-of-archive").unwrap();
        let resolved = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(resolved.path(), path.as_path());
        let canonical = std::fs::canonicalize(&path).unwrap();
        assert_eq!(resolved.document_id(), canonical.to_string_lossy());
    }
}
