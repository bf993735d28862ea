//! Common document envelope (identity, audit fields, soft-delete marker)

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{DocumentId, DocumentKind};

/// Fields embedded in every stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEnvelope {
    pub id: DocumentId,
    /// Partition (tenant) the document belongs to
    pub namespace_id: Uuid,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by_name: Option<String>,
    /// Soft-delete tombstone; a deleted document stays readable for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl DocumentEnvelope {
    pub fn new(namespace_id: Uuid, id: DocumentId) -> Self {
        Self {
            id,
            namespace_id,
            updated: Utc::now(),
            updated_by: None,
            updated_by_name: None,
            deleted: None,
        }
    }

    pub fn with_updated_by(mut self, principal: Uuid, name: impl Into<String>) -> Self {
        self.updated_by = Some(principal);
        self.updated_by_name = Some(name.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    /// Mark the document inactive
    pub fn soft_delete(&mut self, at: DateTime<Utc>) {
        self.deleted = Some(at);
        self.updated = at;
    }

    /// Refresh audit fields before a write
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated = at;
    }
}

/// A value that can be stored in a [`DocumentStore`](crate::DocumentStore)
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Kind every identifier of this document type must carry.
    ///
    /// Some types are stored under more than one kind (certificate records and
    /// their latest aliases); those return `None` and rely on the caller.
    fn expected_kind() -> Option<DocumentKind>;

    fn envelope(&self) -> &DocumentEnvelope;

    fn id(&self) -> DocumentId {
        self.envelope().id
    }

    fn namespace_id(&self) -> Uuid {
        self.envelope().namespace_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_delete_marks_inactive() {
        let mut envelope = DocumentEnvelope::new(
            Uuid::new_v4(),
            DocumentId::generate(DocumentKind::CertificateTemplate),
        );
        assert!(!envelope.is_deleted());

        let at = Utc::now();
        envelope.soft_delete(at);
        assert!(envelope.is_deleted());
        assert_eq!(envelope.updated, at);
    }

    #[test]
    fn test_optional_audit_fields_are_omitted() {
        let envelope =
            DocumentEnvelope::new(Uuid::new_v4(), DocumentId::generate(DocumentKind::Policy));
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("deleted").is_none());
        assert!(json.get("updated_by").is_none());

        let with_principal = envelope.with_updated_by(Uuid::new_v4(), "operator");
        let json = serde_json::to_value(&with_principal).unwrap();
        assert_eq!(json["updated_by_name"], "operator");
    }
}
