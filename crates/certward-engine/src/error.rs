use certward_keys::KeyCustodyError;
use certward_store::{Document, StoreError};
use thiserror::Error;

use crate::record::CertificateRecord;

/// Issuance engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Template or engine configuration cannot be honoured
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Key custody or content storage failed
    #[error("Remote dependency error: {0}")]
    Remote(String),

    /// PEM/DER/x509 encoding or parsing failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// The record is committed but the latest alias still points elsewhere.
    /// Retry with [`Pipeline::publish_alias`](crate::Pipeline::publish_alias).
    #[error("Certificate {} persisted but latest alias not published: {source}", record.id())]
    AliasPending {
        record: Box<CertificateRecord>,
        source: StoreError,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    /// The committed record when only alias publication failed
    pub fn pending_record(&self) -> Option<&CertificateRecord> {
        match self {
            EngineError::AliasPending { record, .. } => Some(record),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } | StoreError::ContentNotFound(_) => {
                EngineError::NotFound(e.to_string())
            }
            StoreError::KindMismatch { .. } | StoreError::InvalidPath(_) => {
                EngineError::Configuration(e.to_string())
            }
            StoreError::Serialization(_) => EngineError::Codec(e.to_string()),
            StoreError::Io(_) | StoreError::Backend(_) => EngineError::Remote(e.to_string()),
        }
    }
}

impl From<KeyCustodyError> for EngineError {
    fn from(e: KeyCustodyError) -> Self {
        match e {
            KeyCustodyError::KeyNotFound(_) | KeyCustodyError::RequestNotFound(_) => {
                EngineError::NotFound(e.to_string())
            }
            KeyCustodyError::InvalidName(_) | KeyCustodyError::Unsupported(_) => {
                EngineError::Configuration(e.to_string())
            }
            KeyCustodyError::Crypto(_) | KeyCustodyError::Io(_) | KeyCustodyError::Backend(_) => {
                EngineError::Remote(e.to_string())
            }
        }
    }
}

impl From<rcgen::Error> for EngineError {
    fn from(e: rcgen::Error) -> Self {
        EngineError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certward_store::{DocumentId, DocumentKind};
    use uuid::Uuid;

    #[test]
    fn test_not_found_survives_conversion() {
        let store = StoreError::NotFound {
            namespace_id: Uuid::new_v4(),
            id: DocumentId::generate(DocumentKind::LatestCertificateAlias),
        };
        assert!(EngineError::from(store).is_not_found());

        let custody = KeyCustodyError::KeyNotFound("root-ca-1".to_string());
        assert!(EngineError::from(custody).is_not_found());
    }

    #[test]
    fn test_backend_failures_are_remote() {
        let err = EngineError::from(KeyCustodyError::Backend("throttled".to_string()));
        assert!(matches!(err, EngineError::Remote(_)));

        let err = EngineError::from(StoreError::Backend("unavailable".to_string()));
        assert!(matches!(err, EngineError::Remote(_)));
    }
}
