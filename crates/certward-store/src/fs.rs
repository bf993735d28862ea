//! Filesystem-backed stores
//!
//! Documents live at `{root}/{namespace}/{document-id}.json`; blobs at
//! `{root}/{path}`. Writes go through a temporary file and a rename so a
//! crashed write never leaves a truncated document behind.

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::content::{validate_path, ContentStore};
use crate::document::DocumentStore;
use crate::error::StoreError;
use crate::id::{DocumentId, DocumentKind};

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// JSON documents on disk
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, namespace_id: Uuid, id: &DocumentId) -> PathBuf {
        self.root
            .join(namespace_id.to_string())
            .join(format!("{}.json", id))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, namespace_id: Uuid, id: &DocumentId) -> Result<Value, StoreError> {
        let path = self.document_path(namespace_id, id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                namespace_id,
                id: *id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert(
        &self,
        namespace_id: Uuid,
        id: &DocumentId,
        document: Value,
    ) -> Result<(), StoreError> {
        let path = self.document_path(namespace_id, id);
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(&path, &bytes).await?;
        debug!("Wrote document {:?}", path);
        Ok(())
    }

    async fn list(&self, namespace_id: Uuid, kind: DocumentKind) -> Result<Vec<Value>, StoreError> {
        let dir = self.root.join(namespace_id.to_string());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            // Foreign files in the directory are ignored
            let Ok(id) = stem.parse::<DocumentId>() else {
                continue;
            };
            if id.kind() == kind {
                found.push(id);
            }
        }
        found.sort();

        let mut documents = Vec::with_capacity(found.len());
        for id in found {
            documents.push(self.get(namespace_id, &id).await?);
        }
        Ok(documents)
    }
}

/// Blobs on disk
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        validate_path(path)?;
        let target = self.root.join(path);
        write_atomic(&target, &bytes).await?;
        Ok(format!("file://{}", target.display()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        validate_path(path)?;
        match fs::read(self.root.join(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ContentNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
