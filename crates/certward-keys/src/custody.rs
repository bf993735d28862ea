//! Key custody boundary
//!
//! Private keys never leave the custody service. The engine asks it to
//! create keys, sign on its behalf, open certificate requests for keys it
//! generates, and take back the signed certificate once issuance completes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::algorithm::{KeySpec, PublicKey, SignatureAlgorithm};
use crate::error::KeyCustodyError;

/// Versioned key identifier inside the custody service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyReference {
    pub name: String,
    pub version: String,
}

impl KeyReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A key the custody service holds, with its public half
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    pub reference: KeyReference,
    pub public_key: PublicKey,
}

/// Parameters for a pending certificate object in the custody service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePolicy {
    /// Common name requested in the CSR
    pub common_name: String,
    pub key: KeySpec,
    /// Reuse the current key version instead of generating a new one
    pub reuse_key: bool,
}

/// Outstanding certificate request returned by
/// [`KeyCustody::create_certificate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCertificate {
    pub id: String,
    /// DER-encoded PKCS#10 request carrying the new key
    pub csr_der: Vec<u8>,
}

/// Identifiers of a certificate merged back into the custody service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedCertificate {
    pub id: String,
    pub kid: KeyReference,
    pub sid: String,
}

#[async_trait]
pub trait KeyCustody: Send + Sync {
    /// Create a new key version under `name`
    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<KeyHandle, KeyCustodyError>;

    /// Fetch a key; `version = None` selects the latest version
    async fn get_key(&self, name: &str, version: Option<&str>)
        -> Result<KeyHandle, KeyCustodyError>;

    /// Sign `message` with the referenced key
    async fn sign(
        &self,
        key: &KeyReference,
        algorithm: SignatureAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, KeyCustodyError>;

    /// Open a certificate request whose key is generated inside the service
    async fn create_certificate(
        &self,
        name: &str,
        policy: &CertificatePolicy,
    ) -> Result<PendingCertificate, KeyCustodyError>;

    /// Complete a pending request with the signed chain, leaf first
    async fn merge_certificate(
        &self,
        name: &str,
        der_chain: &[Vec<u8>],
    ) -> Result<MergedCertificate, KeyCustodyError>;
}

/// Key names must be usable as vault object names: ASCII alphanumerics and `-`
pub fn validate_key_name(name: &str) -> Result<(), KeyCustodyError> {
    if name.is_empty()
        || name.len() > 127
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(KeyCustodyError::InvalidName(name.to_string()));
    }
    Ok(())
}
