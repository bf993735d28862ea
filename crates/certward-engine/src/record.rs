//! Issued certificate records and the per-template latest alias

use certward_keys::{KeyReference, KeySpec, SignatureAlgorithm};
use certward_store::{Document, DocumentEnvelope, DocumentId, DocumentKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::{CertificateUsage, SubjectAlternativeNames};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateKeyMetadata {
    /// Algorithm declared for the certificate's own key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SignatureAlgorithm>,
    pub key: KeySpec,
    /// Algorithm the issuer signed this certificate with
    pub signature_algorithm: SignatureAlgorithm,
    pub thumbprint_sha1: String,
    pub thumbprint_sha256: String,
    pub certificate_url: String,
    /// Key custody key backing this certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<String>,
}

/// One issuance, immutable apart from its tombstone
///
/// The same shape is stored under the template's
/// [`DocumentKind::LatestCertificateAlias`] id, with `alias_id` pointing back
/// at the real record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,

    pub template_id: DocumentId,
    pub issuer_namespace_id: Uuid,
    /// Equal to the record's own id for self-signed certificates
    pub issuer_certificate_id: DocumentId,

    /// Set on the alias only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_id: Option<DocumentId>,
    /// Certificate this issuance replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<DocumentId>,

    pub subject: String,
    pub subject_base: String,
    #[serde(default)]
    pub subject_alternative_names: SubjectAlternativeNames,
    #[serde(default)]
    pub subject_alternative_names_base: SubjectAlternativeNames,

    /// Hex-encoded serial number
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub usage: CertificateUsage,

    /// Content store path of the PEM chain
    pub blob_path: String,
    pub blob_url: String,

    pub key: CertificateKeyMetadata,
}

impl Document for CertificateRecord {
    // Stored as both Certificate and LatestCertificateAlias
    fn expected_kind() -> Option<DocumentKind> {
        None
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }
}

impl CertificateRecord {
    /// Alias identifier for a template
    pub fn latest_alias_id(template_id: &DocumentId) -> DocumentId {
        template_id.with_kind(DocumentKind::LatestCertificateAlias)
    }

    /// Active iff not deleted and `not_before <= now < not_after`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.envelope.is_deleted() && self.not_before <= now && now < self.not_after
    }

    pub fn is_alias(&self) -> bool {
        self.envelope.id.kind() == DocumentKind::LatestCertificateAlias
    }

    /// Id of the real certificate record, for aliases and records alike
    pub fn certificate_id(&self) -> DocumentId {
        self.alias_id.unwrap_or(self.envelope.id)
    }

    pub fn is_self_signed(&self) -> bool {
        self.issuer_certificate_id == self.certificate_id()
    }

    /// The alias document pointing at this record
    pub fn to_latest_alias(&self) -> CertificateRecord {
        let mut alias = self.clone();
        alias.envelope.id = Self::latest_alias_id(&self.template_id);
        alias.envelope.updated = Utc::now();
        alias.alias_id = Some(self.certificate_id());
        alias
    }
}
