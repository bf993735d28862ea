//! Document store boundary
//!
//! The engine only needs "read a document by id" and "upsert a document".
//! Backends store JSON values; [`DocumentStoreExt`] layers typed reads and
//! writes with kind assertions on top.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use crate::envelope::Document;
use crate::error::StoreError;
use crate::id::{DocumentId, DocumentKind};

/// Read/write-by-key document storage, partitioned by namespace
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document; [`StoreError::NotFound`] when absent
    async fn get(&self, namespace_id: Uuid, id: &DocumentId) -> Result<Value, StoreError>;

    /// Insert or replace the document stored under `(namespace_id, id)`
    async fn upsert(
        &self,
        namespace_id: Uuid,
        id: &DocumentId,
        document: Value,
    ) -> Result<(), StoreError>;

    /// All documents of one kind in a namespace, soft-deleted ones included
    async fn list(&self, namespace_id: Uuid, kind: DocumentKind) -> Result<Vec<Value>, StoreError>;
}

/// Typed helpers over any [`DocumentStore`]
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn read<D: Document>(&self, namespace_id: Uuid, id: &DocumentId) -> Result<D, StoreError> {
        if let Some(expected) = D::expected_kind() {
            if id.kind() != expected {
                return Err(StoreError::KindMismatch {
                    id: *id,
                    expected,
                    actual: id.kind(),
                });
            }
        }

        let value = self.get(namespace_id, id).await?;
        let document: D = serde_json::from_value(value)?;

        // The stored envelope must agree with the key it was read from
        if document.id() != *id {
            return Err(StoreError::KindMismatch {
                id: *id,
                expected: id.kind(),
                actual: document.id().kind(),
            });
        }

        Ok(document)
    }

    async fn write<D: Document>(&self, document: &D) -> Result<(), StoreError> {
        let id = document.id();
        if let Some(expected) = D::expected_kind() {
            if id.kind() != expected {
                return Err(StoreError::KindMismatch {
                    id,
                    expected,
                    actual: id.kind(),
                });
            }
        }

        let value = serde_json::to_value(document)?;
        self.upsert(document.namespace_id(), &id, value).await
    }

    async fn read_all<D: Document>(
        &self,
        namespace_id: Uuid,
        kind: DocumentKind,
    ) -> Result<Vec<D>, StoreError> {
        self.list(namespace_id, kind)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }
}

impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}

/// In-process document store
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<DashMap<(Uuid, DocumentId), Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of stored documents of one kind across all namespaces
    pub fn count_kind(&self, kind: DocumentKind) -> usize {
        self.documents
            .iter()
            .filter(|entry| entry.key().1.kind() == kind)
            .count()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, namespace_id: Uuid, id: &DocumentId) -> Result<Value, StoreError> {
        self.documents
            .get(&(namespace_id, *id))
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound {
                namespace_id,
                id: *id,
            })
    }

    async fn upsert(
        &self,
        namespace_id: Uuid,
        id: &DocumentId,
        document: Value,
    ) -> Result<(), StoreError> {
        trace!("Upserting document {}/{}", namespace_id, id);
        self.documents.insert((namespace_id, *id), document);
        Ok(())
    }

    async fn list(&self, namespace_id: Uuid, kind: DocumentKind) -> Result<Vec<Value>, StoreError> {
        let mut entries: Vec<(DocumentId, Value)> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == namespace_id && entry.key().1.kind() == kind)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        Ok(entries.into_iter().map(|(_, value)| value).collect())
    }
}
