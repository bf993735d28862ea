//! Typed document identifiers
//!
//! Every document in a namespace is addressed by a [`DocumentId`]: a kind tag
//! followed by a 128-bit value. The kind travels with the identifier, so one
//! keyspace can hold heterogeneous document types without collisions and
//! readers can assert what they expect to get back.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Document kinds sharing a namespace keyspace
///
/// Declaration order is the ordering used by [`DocumentId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DocumentKind {
    Certificate = 0x01,
    LatestCertificateAlias = 0x02,
    CertificateTemplate = 0x03,
    Policy = 0x04,
    NamespaceRelation = 0x05,
    DirectoryObject = 0x06,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 6] = [
        DocumentKind::Certificate,
        DocumentKind::LatestCertificateAlias,
        DocumentKind::CertificateTemplate,
        DocumentKind::Policy,
        DocumentKind::NamespaceRelation,
        DocumentKind::DirectoryObject,
    ];

    /// One-byte tag used in the binary form
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Prefix used in the text form
    pub fn prefix(self) -> &'static str {
        match self {
            DocumentKind::Certificate => "cert",
            DocumentKind::LatestCertificateAlias => "cert-latest",
            DocumentKind::CertificateTemplate => "cert-template",
            DocumentKind::Policy => "policy",
            DocumentKind::NamespaceRelation => "ns-rel",
            DocumentKind::DirectoryObject => "dir",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentIdError {
    #[error("Invalid document id: {0}")]
    Malformed(String),

    #[error("Unknown document kind: {0}")]
    UnknownKind(String),
}

/// Kind-tagged 128-bit document identifier
///
/// Ordering is structural: kind first, then value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentId {
    kind: DocumentKind,
    value: Uuid,
}

impl DocumentId {
    pub const BINARY_LEN: usize = 17;

    pub fn new(kind: DocumentKind, value: Uuid) -> Self {
        Self { kind, value }
    }

    /// New identifier with a random (v4) value
    pub fn generate(kind: DocumentKind) -> Self {
        Self::new(kind, Uuid::new_v4())
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn value(&self) -> Uuid {
        self.value
    }

    /// Same value re-tagged with another kind
    pub fn with_kind(&self, kind: DocumentKind) -> Self {
        Self::new(kind, self.value)
    }

    pub fn to_bytes(&self) -> [u8; Self::BINARY_LEN] {
        let mut bytes = [0u8; Self::BINARY_LEN];
        bytes[0] = self.kind.tag();
        bytes[1..].copy_from_slice(self.value.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentIdError> {
        if bytes.len() != Self::BINARY_LEN {
            return Err(DocumentIdError::Malformed(format!(
                "expected {} bytes, got {}",
                Self::BINARY_LEN,
                bytes.len()
            )));
        }

        let kind = DocumentKind::from_tag(bytes[0])
            .ok_or_else(|| DocumentIdError::UnknownKind(format!("tag {:#04x}", bytes[0])))?;
        let value = Uuid::from_slice(&bytes[1..])
            .map_err(|e| DocumentIdError::Malformed(e.to_string()))?;

        Ok(Self::new(kind, value))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.value)
    }
}

impl FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A hyphenated UUID is always 36 characters; everything before it
        // (minus the separator) is the kind prefix.
        if s.len() < 38 || !s.is_char_boundary(s.len() - 36) {
            return Err(DocumentIdError::Malformed(s.to_string()));
        }

        let (head, uuid) = s.split_at(s.len() - 36);
        let prefix = head
            .strip_suffix('-')
            .ok_or_else(|| DocumentIdError::Malformed(s.to_string()))?;
        let kind = DocumentKind::from_prefix(prefix)
            .ok_or_else(|| DocumentIdError::UnknownKind(prefix.to_string()))?;
        let value = Uuid::parse_str(uuid).map_err(|e| DocumentIdError::Malformed(e.to_string()))?;

        Ok(Self::new(kind, value))
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_form_round_trips_every_kind() {
        for kind in DocumentKind::ALL {
            let id = DocumentId::generate(kind);
            let parsed: DocumentId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed.kind(), kind);
        }
    }

    #[test]
    fn test_binary_form_carries_kind() {
        let id = DocumentId::generate(DocumentKind::LatestCertificateAlias);
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], DocumentKind::LatestCertificateAlias.tag());
        assert_eq!(DocumentId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let value = Uuid::new_v4();
        let err = format!("bogus-{}", value).parse::<DocumentId>().unwrap_err();
        assert_eq!(err, DocumentIdError::UnknownKind("bogus".to_string()));

        let mut bytes = DocumentId::generate(DocumentKind::Policy).to_bytes();
        bytes[0] = 0xff;
        assert!(matches!(
            DocumentId::from_bytes(&bytes),
            Err(DocumentIdError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("cert".parse::<DocumentId>().is_err());
        assert!("cert-not-a-uuid-at-all-but-long-enough-x".parse::<DocumentId>().is_err());
        assert!(DocumentId::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_ordering_is_kind_then_value() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        let a = DocumentId::new(DocumentKind::Certificate, high);
        let b = DocumentId::new(DocumentKind::LatestCertificateAlias, low);
        assert!(a < b);

        let c = DocumentId::new(DocumentKind::Certificate, low);
        assert!(c < a);
    }

    #[test]
    fn test_same_value_different_kind_is_distinct() {
        let value = Uuid::new_v4();
        let cert = DocumentId::new(DocumentKind::Certificate, value);
        let alias = cert.with_kind(DocumentKind::LatestCertificateAlias);
        assert_ne!(cert, alias);
        assert_eq!(cert.value(), alias.value());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = DocumentId::generate(DocumentKind::CertificateTemplate);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
