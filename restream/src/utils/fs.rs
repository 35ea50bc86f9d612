//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! the mtime lookups the stream tasks rely on.

use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Modification time of `path`, or `None` if it does not exist or the
/// platform cannot report it.
pub async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Age of a timestamp relative to `now`; timestamps in the future count as zero.
pub fn age_of(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("hls").join("news1");

        ensure_dir_all_with_op("creating output directory", &nested)
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn test_modified_at_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(modified_at(&temp.path().join("index.m3u8")).await.is_none());
    }

    #[test]
    fn test_age_of_future_timestamp_is_zero() {
        let now = SystemTime::now();
        assert_eq!(age_of(now + Duration::from_secs(5), now), Duration::ZERO);
        assert_eq!(
            age_of(now - Duration::from_secs(5), now),
            Duration::from_secs(5)
        );
    }
}
