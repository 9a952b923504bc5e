//! Local-filesystem file store.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::provider::{FileProviderError, FileStoreProvider, RemoteFile};

/// File store rooted at a directory on the local disk.
pub struct LocalFileProvider {
    root: PathBuf,
}

impl LocalFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Revision = mtime in nanoseconds. Precise enough for exact compare,
    /// no second-granularity buffer needed.
    async fn rev_of(path: &Path) -> Result<Option<String>, FileProviderError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let modified = meta.modified()?;
                let nanos = modified
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                Ok(Some(nanos.to_string()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl FileStoreProvider for LocalFileProvider {
    async fn is_ready(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn download_file(&self, path: &str) -> Result<RemoteFile, FileProviderError> {
        let full = self.resolve(path);
        let data = match tokio::fs::read(&full).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FileProviderError::NotFound(path.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let rev = Self::rev_of(&full).await?.unwrap_or_default();
        Ok(RemoteFile { rev, data })
    }

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        expected_rev: Option<&str>,
        force_overwrite: bool,
    ) -> Result<String, FileProviderError> {
        let full = self.resolve(path);
        if !force_overwrite {
            let current = Self::rev_of(&full).await?;
            match (expected_rev, current.as_deref()) {
                (Some(expected), Some(actual)) if expected != actual => {
                    return Err(FileProviderError::RevMismatch {
                        expected: Some(expected.to_string()),
                        actual: Some(actual.to_string()),
                    });
                }
                (Some(expected), None) => {
                    return Err(FileProviderError::RevMismatch {
                        expected: Some(expected.to_string()),
                        actual: None,
                    });
                }
                (None, Some(actual)) => {
                    return Err(FileProviderError::RevMismatch {
                        expected: None,
                        actual: Some(actual.to_string()),
                    });
                }
                _ => {}
            }
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename keeps readers from seeing a torn file.
        let tmp = full.with_extension("tmp-upload");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &full).await?;

        Ok(Self::rev_of(&full).await?.unwrap_or_default())
    }

    async fn remove(
        &self,
        path: &str,
        expected_rev: Option<&str>,
    ) -> Result<(), FileProviderError> {
        let full = self.resolve(path);
        let current = Self::rev_of(&full).await?;
        let Some(actual) = current else {
            return Err(FileProviderError::NotFound(path.to_string()));
        };
        if let Some(expected) = expected_rev {
            if expected != actual {
                return Err(FileProviderError::RevMismatch {
                    expected: Some(expected.to_string()),
                    actual: Some(actual),
                });
            }
        }
        tokio::fs::remove_file(&full).await?;
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>, FileProviderError> {
        let full = self.resolve(path);
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(format!("{}/{}", path.trim_end_matches('/'), name));
            }
        }
        Ok(names)
    }

    async fn create_dir(&self, path: &str) -> Result<(), FileProviderError> {
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_conditional_replace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalFileProvider::new(dir.path());

        let rev = provider
            .upload_file("sync/sync-data.json", b"v1", None, false)
            .await
            .expect("create");
        let file = provider
            .download_file("sync/sync-data.json")
            .await
            .expect("download");
        assert_eq!(file.data, b"v1");
        assert_eq!(file.rev, rev);

        provider
            .upload_file("sync/sync-data.json", b"v2", Some(&rev), false)
            .await
            .expect("conditional replace");
        let err = provider
            .upload_file("sync/sync-data.json", b"v3", Some(&rev), false)
            .await
            .expect_err("stale rev must fail");
        assert!(err.is_rev_mismatch());
    }

    #[tokio::test]
    async fn create_only_fails_on_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalFileProvider::new(dir.path());
        provider
            .upload_file("f.json", b"one", None, false)
            .await
            .expect("create");
        let err = provider
            .upload_file("f.json", b"two", None, false)
            .await
            .expect_err("create-only");
        assert!(err.is_rev_mismatch());
        // Force path writes through.
        provider
            .upload_file("f.json", b"two", None, true)
            .await
            .expect("force overwrite");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalFileProvider::new(dir.path());
        let err = provider
            .download_file("missing.json")
            .await
            .expect_err("missing");
        assert!(matches!(err, FileProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_files_returns_folder_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = LocalFileProvider::new(dir.path());
        provider
            .upload_file("sync/a.json", b"a", None, false)
            .await
            .expect("a");
        provider
            .upload_file("sync/b.json", b"b", None, false)
            .await
            .expect("b");
        let mut files = provider.list_files("sync").await.expect("list");
        files.sort();
        assert_eq!(files, vec!["sync/a.json", "sync/b.json"]);
    }
}
