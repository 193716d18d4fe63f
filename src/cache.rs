//! Flat filesystem store for cached job results.
//!
//! Blobs live at `<dir>/<job_id><suffix>`. The store is not safe against
//! concurrent writers in other processes; within this process the registry
//! serialises writes through the single post-execute path.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

/// Builds the blob path for a job id.
pub fn cache_path(dir: &Path, job_id: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{job_id}{suffix}"))
}

pub async fn exists(dir: &Path, job_id: &str, suffix: &str) -> bool {
    fs::try_exists(cache_path(dir, job_id, suffix))
        .await
        .unwrap_or(false)
}

/// Reads a blob, returning `None` if it is missing. Read failures also
/// yield `None` after logging: the caller falls through to re-execution.
pub async fn read(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path).await {
        Ok(data) => Some(data),
        Err(error) if error.kind() == io::ErrorKind::NotFound => None,
        Err(error) => {
            warn!(%error, path = %path.display(), "failed to read cache blob");
            None
        },
    }
}

/// Writes a blob, creating parent directories as needed.
pub async fn write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await
}

/// Deletes a blob, reporting whether it existed.
pub async fn delete(path: &Path) -> bool {
    fs::remove_file(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_layout() {
        let path = cache_path(Path::new("/tmp/cache"), "abc123", ".cache");
        assert_eq!(path, PathBuf::from("/tmp/cache/abc123.cache"));
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "job-1", ".cache");

        assert!(!exists(dir.path(), "job-1", ".cache").await);
        assert_eq!(read(&path).await, None);

        write(&path, b"payload").await.unwrap();

        assert!(exists(dir.path(), "job-1", ".cache").await);
        assert_eq!(read(&path).await.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(&dir.path().join("nested/deeper"), "job-2", ".bin");

        write(&path, &[1, 2, 3]).await.unwrap();

        assert_eq!(read(&path).await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = cache_path(dir.path(), "job-3", ".cache");

        assert!(!delete(&path).await);

        write(&path, b"x").await.unwrap();

        assert!(delete(&path).await);
        assert_eq!(read(&path).await, None);
    }
}
