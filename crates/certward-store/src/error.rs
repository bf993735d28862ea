use thiserror::Error;
use uuid::Uuid;

use crate::id::{DocumentId, DocumentKind};

/// Document and content store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {namespace_id}/{id}")]
    NotFound { namespace_id: Uuid, id: DocumentId },

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Document {id} has kind {actual}, expected {expected}")]
    KindMismatch {
        id: DocumentId,
        expected: DocumentKind,
        actual: DocumentKind,
    },

    #[error("Invalid content path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::ContentNotFound(_)
        )
    }
}
