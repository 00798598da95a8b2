//! Content-addressed storage for overlay file bytes.
//!
//! Objects live in an [`ObjectStore`] under `<prefix>/<hh>/<sha256>` where `hh`
//! is the first two hex characters of the digest. The registry holds one
//! reference per content entry; objects whose count drops to zero stay on disk
//! until [`ContentStore::reclaim`] runs.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ContentConfig, ContentStoreType};
use crate::error::{OverlayError, OverlayResult};
use crate::types::ContentRef;

/// Result of storing a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    /// Reference to the stored object.
    pub content: ContentRef,
    /// Size in bytes.
    pub size: u64,
}

/// Reference-counted, content-addressed blob store.
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    refcounts: DashMap<ContentRef, usize>,
    // Held for writing while reclaim deletes objects, for reading by put/get.
    gate: RwLock<()>,
}

impl ContentStore {
    /// Create a content store over an object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_owned(),
            refcounts: DashMap::new(),
            gate: RwLock::new(()),
        }
    }

    /// Create a content store from configuration.
    pub fn from_config(config: &ContentConfig) -> OverlayResult<Self> {
        let store = create_object_store(config)?;
        Ok(Self::new(store, config.prefix.clone()))
    }

    /// Create a content store backed by memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()), "overlay-content")
    }

    /// Store bytes and take one reference to them.
    ///
    /// Identical bytes map to the same reference and are written once.
    pub async fn put(&self, data: Bytes) -> OverlayResult<StoredContent> {
        let content = content_ref_for(&data);
        let size = u64::try_from(data.len())
            .map_err(|_| OverlayError::internal("content size overflows u64"))?;

        let _gate = self.gate.read().await;
        *self.refcounts.entry(content.clone()).or_insert(0) += 1;

        let path = self.object_path(&content);
        let write = match self.store.head(&path).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(path = %path, size, "writing content object");
                self.store.put(&path, data.into()).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = write {
            self.decrement(&content);
            return Err(e.into());
        }

        Ok(StoredContent { content, size })
    }

    /// Read the bytes behind a reference.
    pub async fn get(&self, content: &ContentRef) -> OverlayResult<Bytes> {
        let _gate = self.gate.read().await;
        let path = self.object_path(content);

        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(OverlayError::ObjectNotFound(content.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(result.bytes().await?)
    }

    /// Drop one reference. At zero the object becomes eligible for reclaim.
    pub fn release(&self, content: &ContentRef) {
        if !self.decrement(content) {
            warn!(content = %content, "released content with no outstanding references");
        }
    }

    /// Take a reference without writing, for objects already on storage.
    pub fn retain(&self, content: &ContentRef) {
        *self.refcounts.entry(content.clone()).or_insert(0) += 1;
    }

    /// Current reference count.
    #[must_use]
    pub fn refcount(&self, content: &ContentRef) -> usize {
        self.refcounts.get(content).map_or(0, |count| *count)
    }

    /// Number of tracked objects with no references.
    #[must_use]
    pub fn orphaned(&self) -> usize {
        self.refcounts.iter().filter(|entry| *entry.value() == 0).count()
    }

    /// Delete every stored object that no content entry references.
    ///
    /// Also sweeps objects under the prefix that were never tracked, such as
    /// bytes orphaned before a restart. Returns the number of deleted objects.
    pub async fn reclaim(&self) -> OverlayResult<usize> {
        let _gate = self.gate.write().await;

        let prefix = (!self.prefix.is_empty()).then(|| ObjectPath::from(self.prefix.as_str()));
        let mut listing = self.store.list(prefix.as_ref());
        let mut doomed = Vec::new();

        while let Some(meta) = listing.next().await {
            let meta = meta?;
            let Some(digest) = meta.location.filename() else {
                continue;
            };
            if self.refcount(&ContentRef::new(digest)) == 0 {
                doomed.push(meta.location.clone());
            }
        }
        drop(listing);

        let mut removed = 0;
        for path in doomed {
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => removed += 1,
                Err(e) => return Err(e.into()),
            }
        }

        self.refcounts.retain(|_, count| *count > 0);

        info!(removed, "reclaimed orphaned content");
        Ok(removed)
    }

    fn decrement(&self, content: &ContentRef) -> bool {
        match self.refcounts.get_mut(content) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn object_path(&self, content: &ContentRef) -> ObjectPath {
        let digest = content.as_str();
        let shard = digest.get(..2).unwrap_or(digest);
        if self.prefix.is_empty() {
            ObjectPath::from(format!("{shard}/{digest}"))
        } else {
            ObjectPath::from(format!("{}/{shard}/{digest}", self.prefix))
        }
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("tracked", &self.refcounts.len())
            .finish_non_exhaustive()
    }
}

/// Compute the content reference (hex SHA-256) for a blob.
#[must_use]
pub fn content_ref_for(data: &[u8]) -> ContentRef {
    ContentRef::new(hex::encode(Sha256::digest(data)))
}

/// Create an object store from configuration.
pub fn create_object_store(config: &ContentConfig) -> OverlayResult<Arc<dyn ObjectStore>> {
    match config.store_type {
        ContentStoreType::Local => {
            std::fs::create_dir_all(&config.path).map_err(|e| {
                OverlayError::Config(format!(
                    "failed to create content directory {}: {e}",
                    config.path
                ))
            })?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&config.path)
                .map_err(|e| OverlayError::Config(format!("failed to create local store: {e}")))?;
            Ok(Arc::new(store))
        }
        ContentStoreType::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        ContentStoreType::S3 => {
            use object_store::aws::AmazonS3Builder;
            let mut builder = AmazonS3Builder::new().with_bucket_name(&config.path);

            if let Some(region) = &config.region {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = &config.endpoint {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(key) = &config.access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = &config.secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }

            let store = builder
                .build()
                .map_err(|e| OverlayError::Config(format!("failed to create S3 store: {e}")))?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = ContentStore::in_memory();
        let stored = store.put(Bytes::from_static(b"service=is added")).await.unwrap();

        assert_eq!(stored.size, 16);
        assert_eq!(stored.content.as_str().len(), 64);
        assert_eq!(
            store.get(&stored.content).await.unwrap(),
            Bytes::from_static(b"service=is added")
        );
    }

    #[tokio::test]
    async fn identical_bytes_share_a_reference() {
        let store = ContentStore::in_memory();
        let a = store.put(Bytes::from_static(b"same")).await.unwrap();
        let b = store.put(Bytes::from_static(b"same")).await.unwrap();

        assert_eq!(a.content, b.content);
        assert_eq!(store.refcount(&a.content), 2);
    }

    #[tokio::test]
    async fn get_unknown_reference_is_not_found() {
        let store = ContentStore::in_memory();
        let err = store.get(&content_ref_for(b"never stored")).await.unwrap_err();
        assert!(matches!(err, OverlayError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn reclaim_removes_only_unreferenced_objects() {
        let store = ContentStore::in_memory();
        let kept = store.put(Bytes::from_static(b"kept")).await.unwrap();
        let dropped = store.put(Bytes::from_static(b"dropped")).await.unwrap();

        store.release(&dropped.content);
        assert_eq!(store.orphaned(), 1);

        assert_eq!(store.reclaim().await.unwrap(), 1);
        assert!(store.get(&kept.content).await.is_ok());
        assert!(store.get(&dropped.content).await.is_err());
        assert_eq!(store.orphaned(), 0);

        assert_eq!(store.reclaim().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_sweeps_untracked_objects() {
        let backend: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let before = ContentStore::new(Arc::clone(&backend), "blobs");
        let stale = before.put(Bytes::from_static(b"left behind")).await.unwrap();

        // Nothing retains the object after a restart.
        let after = ContentStore::new(backend, "blobs");
        assert_eq!(after.reclaim().await.unwrap(), 1);
        assert!(after.get(&stale.content).await.is_err());
    }

    #[tokio::test]
    async fn retain_protects_restored_objects() {
        let backend: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let before = ContentStore::new(Arc::clone(&backend), "blobs");
        let stored = before.put(Bytes::from_static(b"restored")).await.unwrap();

        let after = ContentStore::new(backend, "blobs");
        after.retain(&stored.content);
        assert_eq!(after.reclaim().await.unwrap(), 0);
        assert!(after.get(&stored.content).await.is_ok());
    }

    #[tokio::test]
    async fn local_filesystem_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContentConfig {
            store_type: ContentStoreType::Local,
            path: dir.path().join("content").display().to_string(),
            ..ContentConfig::default()
        };
        let store = ContentStore::from_config(&config).unwrap();
        let stored = store.put(Bytes::from_static(b"on disk")).await.unwrap();

        let digest = stored.content.as_str();
        let expected = dir
            .path()
            .join("content")
            .join("overlay-content")
            .join(&digest[..2])
            .join(digest);
        assert!(expected.exists(), "missing {}", expected.display());
    }
}
