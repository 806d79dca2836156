//! Object-storage port and an in-memory implementation with signed
//! pseudo-presigned URLs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::config::chrono_duration;
use crate::error::{ProtectionError, Result};

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStat {
    /// Object size in bytes.
    pub size: u64,
    /// Declared content type.
    pub content_type: String,
}

/// A time-limited download URL.
#[derive(Debug, Clone)]
pub struct PresignedUrl {
    /// The signed URL.
    pub url: String,
    /// Hard expiry of the URL.
    pub expires_at: DateTime<Utc>,
}

/// Object-storage operations consumed by the protection core.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetches a whole object. Missing keys are a [`ProtectionError::StorageError`].
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Stores an object, replacing any previous content.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()>;

    /// Removes an object. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Object metadata.
    async fn stat(&self, key: &str) -> Result<BlobStat>;

    /// Produces a time-limited GET URL for the object.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl>;
}

/// In-memory [`BlobStore`] for tests and single-process wiring.
///
/// Presigned URLs carry a deterministic signature over
/// `key/expiry/instance-secret` so tests can assert URL stability.
pub struct InMemoryBlobStore {
    objects: DashMap<String, (Vec<u8>, String)>,
    url_secret: [u8; 16],
}

impl InMemoryBlobStore {
    /// Creates an empty store with a random URL-signing secret.
    pub fn new() -> Self {
        let mut url_secret = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut url_secret);
        Self {
            objects: DashMap::new(),
            url_secret,
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns true when the key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    fn sign(&self, key: &str, expires_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url_secret);
        hasher.update(key.as_bytes());
        hasher.update(expires_at.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| ProtectionError::StorageError {
                reason: format!("no object at key {key:?}"),
            })
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        tracing::debug!(key, size = data.len(), "blob put");
        self.objects
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tracing::debug!(key, "blob delete");
        self.objects.remove(key);
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<BlobStat> {
        self.objects
            .get(key)
            .map(|entry| BlobStat {
                size: entry.0.len() as u64,
                content_type: entry.1.clone(),
            })
            .ok_or_else(|| ProtectionError::StorageError {
                reason: format!("no object at key {key:?}"),
            })
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl> {
        if !self.objects.contains_key(key) {
            return Err(ProtectionError::StorageError {
                reason: format!("no object at key {key:?}"),
            });
        }
        let expires_at = Utc::now() + chrono_duration(ttl);
        let sig = self.sign(key, expires_at.timestamp());
        Ok(PresignedUrl {
            url: format!(
                "memblob:///{key}?expires={}&sig={sig}",
                expires_at.timestamp()
            ),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = InMemoryBlobStore::new();
        store
            .put("materials/a.pdf", vec![1, 2, 3], "application/pdf")
            .await
            .unwrap();
        assert_eq!(store.get("materials/a.pdf").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_get_missing_is_storage_error() {
        let store = InMemoryBlobStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageError);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryBlobStore::new();
        store.put("k", vec![0], "application/octet-stream").await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stat_reports_size_and_type() {
        let store = InMemoryBlobStore::new();
        store
            .put("k", vec![0u8; 42], "application/pdf")
            .await
            .unwrap();
        let stat = store.stat("k").await.unwrap();
        assert_eq!(stat.size, 42);
        assert_eq!(stat.content_type, "application/pdf");
    }

    #[tokio::test]
    async fn test_presign_embeds_expiry_and_signature() {
        let store = InMemoryBlobStore::new();
        store.put("k", vec![0], "application/pdf").await.unwrap();
        let url = store
            .presign_get("k", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.url.contains("sig="));
        assert!(url.url.contains("expires="));
        assert!(url.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_presign_missing_object_fails() {
        let store = InMemoryBlobStore::new();
        assert!(store
            .presign_get("nope", Duration::from_secs(60))
            .await
            .is_err());
    }
}
