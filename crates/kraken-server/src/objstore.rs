// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem-backed object store.
//!
//! Objects live in buckets under the data directory:
//!
//! | Bucket | Contents |
//! |--------|----------|
//! | `NNNNNNNN` | artifacts of a branch |
//! | `NNNNNNNN-cache` | step caches of a branch, swept after 10 days |
//! | `NNNNNNNN-git` | clone bundles of stage repositories |
//! | `tool-N` | tool packages |

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Age after which cache objects are removed.
pub const CACHE_LIFETIME: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// A bucket of the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Artifacts(i64),
    Cache(i64),
    Git(i64),
    Tool(i64),
}

impl Bucket {
    /// Directory name of the bucket.
    pub fn name(&self) -> String {
        match self {
            Self::Artifacts(branch) => format!("{:08}", branch),
            Self::Cache(branch) => format!("{:08}-cache", branch),
            Self::Git(branch) => format!("{:08}-git", branch),
            Self::Tool(tool) => format!("tool-{}", tool),
        }
    }

    /// Bucket of a directory name, the inverse of [`Bucket::name`].
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(tool) = name.strip_prefix("tool-") {
            return tool.parse().ok().map(Self::Tool);
        }
        let (branch, suffix) = match name.split_once('-') {
            Some((branch, suffix)) => (branch, Some(suffix)),
            None => (name, None),
        };
        if branch.len() < 8 || !branch.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let branch = branch.parse().ok()?;
        match suffix {
            None => Some(Self::Artifacts(branch)),
            Some("cache") => Some(Self::Cache(branch)),
            Some("git") => Some(Self::Git(branch)),
            Some(_) => None,
        }
    }
}

/// Object store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, bucket: Bucket, key: &str) -> Result<PathBuf> {
        let key_path = Path::new(key);
        let valid = !key.is_empty()
            && key_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::InvalidRequest(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(bucket.name()).join(key_path))
    }

    /// Store an object, replacing any previous content.
    pub async fn put(&self, bucket: Bucket, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so readers never see a partial object
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(bucket = %bucket.name(), key, size = data.len(), "Object stored");
        Ok(())
    }

    /// Read an object, `None` when it does not exist.
    pub async fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, bucket: Bucket, key: &str) -> Result<bool> {
        let path = self.path(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Remove an object. Removing a missing object is not an error.
    pub async fn delete(&self, bucket: Bucket, key: &str) -> Result<()> {
        let path = self.path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Local path of an object, for tools that stream from disk.
    pub fn object_path(&self, bucket: Bucket, key: &str) -> Result<PathBuf> {
        self.path(bucket, key)
    }

    /// Remove cache objects not modified within `lifetime`.
    ///
    /// Returns the number of removed files.
    pub async fn sweep_caches(&self, lifetime: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut buckets = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = buckets.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with("-cache") {
                continue;
            }
            removed += sweep_dir(entry.path(), now, lifetime).await?;
        }
        if removed > 0 {
            info!(removed, "Expired cache objects removed");
        }
        Ok(removed)
    }
}

async fn sweep_dir(dir: PathBuf, now: SystemTime, lifetime: Duration) -> Result<usize> {
    let mut removed = 0;
    let mut stack = vec![dir];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age > lifetime {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Cannot remove cache object"),
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert_eq!(Bucket::Artifacts(12).name(), "00000012");
        assert_eq!(Bucket::Cache(3).name(), "00000003-cache");
        assert_eq!(Bucket::Git(123456789).name(), "123456789-git");
        assert_eq!(Bucket::Tool(4).name(), "tool-4");
    }

    #[test]
    fn test_bucket_parse() {
        for bucket in [Bucket::Artifacts(12), Bucket::Cache(3), Bucket::Git(123456789), Bucket::Tool(4)] {
            assert_eq!(Bucket::parse(&bucket.name()), Some(bucket));
        }
        assert_eq!(Bucket::parse("12"), None);
        assert_eq!(Bucket::parse("00000012-logs"), None);
        assert_eq!(Bucket::parse("tool-x"), None);
        assert_eq!(Bucket::parse(".."), None);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let bucket = Bucket::Artifacts(1);

        assert_eq!(store.get(bucket, "a/b.txt").await.unwrap(), None);
        store.put(bucket, "a/b.txt", b"hello").await.unwrap();
        assert!(store.exists(bucket, "a/b.txt").await.unwrap());
        assert_eq!(
            store.get(bucket, "a/b.txt").await.unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        assert!(dir.path().join("00000001/a/b.txt").exists());

        store.delete(bucket, "a/b.txt").await.unwrap();
        store.delete(bucket, "a/b.txt").await.unwrap();
        assert!(!store.exists(bucket, "a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        assert!(store.put(Bucket::Cache(1), "../x", b"").await.is_err());
        assert!(store.put(Bucket::Cache(1), "/etc/passwd", b"").await.is_err());
        assert!(store.get(Bucket::Cache(1), "").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_only_touches_cache_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        store.put(Bucket::Cache(1), "x/old", b"1").await.unwrap();
        store.put(Bucket::Artifacts(1), "keep", b"1").await.unwrap();

        // zero lifetime expires everything that is not brand new
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = store.sweep_caches(Duration::from_millis(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists(Bucket::Cache(1), "x/old").await.unwrap());
        assert!(store.exists(Bucket::Artifacts(1), "keep").await.unwrap());

        assert_eq!(store.sweep_caches(CACHE_LIFETIME).await.unwrap(), 0);
    }
}
