//! In-memory file store for tests and ephemeral use.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::provider::{FileProviderError, FileStoreProvider, RemoteFile};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    rev: u64,
}

/// Process-memory provider with faithful conditional-write semantics.
#[derive(Default)]
pub struct InMemoryFileProvider {
    files: Mutex<HashMap<String, Entry>>,
    dirs: Mutex<HashSet<String>>,
    next_rev: AtomicUsize,
    precondition_failures: AtomicUsize,
    conditional_writes: bool,
}

impl InMemoryFileProvider {
    pub fn new() -> Self {
        Self {
            conditional_writes: true,
            ..Self::default()
        }
    }

    /// Variant emulating stores that ignore preconditions entirely.
    pub fn without_conditional_writes() -> Self {
        Self {
            conditional_writes: false,
            ..Self::default()
        }
    }

    /// How many uploads failed their revision check so far.
    pub fn precondition_failures(&self) -> usize {
        self.precondition_failures.load(Ordering::Relaxed)
    }

    fn mint_rev(&self) -> u64 {
        self.next_rev.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn rev_string(rev: u64) -> String {
        format!("rev-{}", rev)
    }
}

#[async_trait]
impl FileStoreProvider for InMemoryFileProvider {
    async fn is_ready(&self) -> bool {
        true
    }

    fn supports_conditional_writes(&self) -> bool {
        self.conditional_writes
    }

    async fn download_file(&self, path: &str) -> Result<RemoteFile, FileProviderError> {
        let files = self.files.lock().expect("files mutex");
        let entry = files
            .get(path)
            .ok_or_else(|| FileProviderError::NotFound(path.to_string()))?;
        Ok(RemoteFile {
            rev: if self.conditional_writes {
                Self::rev_string(entry.rev)
            } else {
                String::new()
            },
            data: entry.data.clone(),
        })
    }

    async fn upload_file(
        &self,
        path: &str,
        data: &[u8],
        expected_rev: Option<&str>,
        force_overwrite: bool,
    ) -> Result<String, FileProviderError> {
        let mut files = self.files.lock().expect("files mutex");
        let current = files.get(path);

        if self.conditional_writes && !force_overwrite {
            match (expected_rev, current) {
                (Some(expected), Some(entry)) => {
                    if Self::rev_string(entry.rev) != expected {
                        self.precondition_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(FileProviderError::RevMismatch {
                            expected: Some(expected.to_string()),
                            actual: Some(Self::rev_string(entry.rev)),
                        });
                    }
                }
                (Some(expected), None) => {
                    self.precondition_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(FileProviderError::RevMismatch {
                        expected: Some(expected.to_string()),
                        actual: None,
                    });
                }
                (None, Some(entry)) => {
                    // Create-only write over an existing file.
                    self.precondition_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(FileProviderError::RevMismatch {
                        expected: None,
                        actual: Some(Self::rev_string(entry.rev)),
                    });
                }
                (None, None) => {}
            }
        }

        let rev = self.mint_rev();
        files.insert(
            path.to_string(),
            Entry {
                data: data.to_vec(),
                rev,
            },
        );
        Ok(Self::rev_string(rev))
    }

    async fn remove(
        &self,
        path: &str,
        expected_rev: Option<&str>,
    ) -> Result<(), FileProviderError> {
        let mut files = self.files.lock().expect("files mutex");
        let Some(entry) = files.get(path) else {
            return Err(FileProviderError::NotFound(path.to_string()));
        };
        if self.conditional_writes {
            if let Some(expected) = expected_rev {
                if Self::rev_string(entry.rev) != expected {
                    self.precondition_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(FileProviderError::RevMismatch {
                        expected: Some(expected.to_string()),
                        actual: Some(Self::rev_string(entry.rev)),
                    });
                }
            }
        }
        files.remove(path);
        Ok(())
    }

    async fn list_files(&self, path: &str) -> Result<Vec<String>, FileProviderError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock().expect("files mutex");
        Ok(files
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), FileProviderError> {
        self.dirs
            .lock()
            .expect("dirs mutex")
            .insert(path.to_string());
        Ok(())
    }
}
