//! Blob storage for PEM chains

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;

/// Path of a certificate's PEM chain blob
pub fn certificate_blob_path(namespace_id: Uuid, cert_id: Uuid) -> String {
    format!("{}/{}.pem", namespace_id, cert_id)
}

/// Key/value blob storage addressed by relative paths
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `bytes` at `path` and return a URL identifying the stored blob
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;
}

/// Reject absolute paths and parent traversal
pub(crate) fn validate_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// In-process content store
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        validate_path(path)?;
        self.blobs.insert(path.to_string(), bytes);
        Ok(format!("memory:///{}", path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        validate_path(path)?;
        self.blobs
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::ContentNotFound(path.to_string()))
    }
}
