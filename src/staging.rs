//! File-backed staging area for draft attachments.
//!
//! Uploaded files are written under the staging directory as
//! `<unix-seconds>_<name>` and removed when their draft is sent, cancelled
//! or discarded.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Directory of staged attachment blobs.
#[derive(Debug, Clone)]
pub struct StagingArea {
    base_path: PathBuf,
}

impl StagingArea {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Resolve a staged name to its path.
    pub fn resolve_path(&self, staged_name: &str) -> PathBuf {
        self.base_path.join(staged_name)
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    /// Store `data` for an upload named `name`, returning the staged name.
    pub async fn store(&self, name: &str, data: &[u8]) -> std::io::Result<String> {
        self.ensure_dir().await?;
        let clean = sanitize(name);
        let mut staged = format!("{}_{clean}", Utc::now().timestamp());
        if fs::try_exists(self.resolve_path(&staged)).await? {
            let tag = Uuid::new_v4().simple().to_string();
            staged = format!("{}_{}_{clean}", Utc::now().timestamp(), &tag[..8]);
        }
        fs::write(self.resolve_path(&staged), data).await?;
        debug!(staged = %staged, bytes = data.len(), "Attachment staged");
        Ok(staged)
    }

    /// Remove a staged blob. Missing blobs are not an error.
    pub async fn delete(&self, staged_name: &str) -> std::io::Result<()> {
        match fs::remove_file(self.resolve_path(&sanitize(staged_name))).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Keep only the final path component of an uploaded name.
fn sanitize(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("report.pdf"), "report.pdf");
        assert_eq!(sanitize(""), "file");
        assert_eq!(sanitize(".."), "file");
    }

    #[tokio::test]
    async fn store_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path().join("temp"));

        let staged = staging.store("notes.txt", b"hello").await.unwrap();
        assert!(staged.ends_with("_notes.txt"));
        let path = staging.resolve_path(&staged);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        staging.delete(&staged).await.unwrap();
        assert!(!path.exists());
        // Deleting twice is fine.
        staging.delete(&staged).await.unwrap();
    }

    #[tokio::test]
    async fn same_name_same_second_does_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path().to_path_buf());
        let a = staging.store("a.txt", b"1").await.unwrap();
        let b = staging.store("a.txt", b"2").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(std::fs::read(staging.resolve_path(&a)).unwrap(), b"1");
        assert_eq!(std::fs::read(staging.resolve_path(&b)).unwrap(), b"2");
    }
}
