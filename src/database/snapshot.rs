//! Durable snapshot stores.
//!
//! A snapshot store is a key → serialized blob map used by the rate limiter
//! to survive restarts. Backends are object safe so the limiter can hold any
//! of them behind `Arc<dyn SnapshotStore>`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::debug;

/// Key → blob persistence.
pub trait SnapshotStore: Send + Sync {
    /// Read the blob stored under `key`, if any.
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>>;

    /// Replace the blob stored under `key`.
    fn save<'a>(&'a self, key: &'a str, blob: String) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Process-local store, mainly for tests and single-run tools.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a blob synchronously.
    pub fn get(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).cloned()
    }

    /// Write a blob synchronously.
    pub fn put(&self, key: &str, blob: impl Into<String>) {
        self.blobs.lock().insert(key.to_string(), blob.into());
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        let blob = self.get(key);
        async move { Ok(blob) }.boxed()
    }

    fn save<'a>(&'a self, key: &'a str, blob: String) -> BoxFuture<'a, anyhow::Result<()>> {
        self.put(key, blob);
        async { Ok(()) }.boxed()
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        async move {
            let path = self.path_for(key);
            match tokio::fs::read_to_string(&path).await {
                Ok(blob) => Ok(Some(blob)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
            }
        }
        .boxed()
    }

    fn save<'a>(&'a self, key: &'a str, blob: String) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("creating {}", self.dir.display()))?;

            // Write-then-rename so a crash never leaves a half-written file.
            let path = self.path_for(key);
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, blob.as_bytes())
                .await
                .with_context(|| format!("writing {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("renaming to {}", path.display()))?;

            debug!("Saved snapshot {} to {}", key, path.display());
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemorySnapshotStore::new();
        assert_eq!(store.load("rate_limits").await.unwrap(), None);

        store.save("rate_limits", "[]".to_string()).await.unwrap();
        assert_eq!(store.load("rate_limits").await.unwrap(), Some("[]".to_string()));
    }

    #[tokio::test]
    async fn test_file_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested"));

        assert_eq!(store.load("request_history").await.unwrap(), None);

        store
            .save("request_history", r#"[{"endpoint":"/a"}]"#.to_string())
            .await
            .unwrap();
        let blob = store.load("request_history").await.unwrap();
        assert_eq!(blob.as_deref(), Some(r#"[{"endpoint":"/a"}]"#));
    }
}
