//! Signer resolution
//!
//! A certificate is signed either by a brand-new key created in key custody
//! (self-issued roots) or by the key behind the issuer's latest certificate
//! (everything chained). Either way the private key stays in custody; the
//! signer forwards signature requests there.

use certward_keys::{
    CertificatePolicy, KeyCustody, KeyCustodyError, KeyHandle, KeyReference, KeySpec, KeyType,
    PublicKey, SignatureAlgorithm,
};
use certward_store::{ContentStore, Document, DocumentStore, DocumentStoreExt};
use chrono::{DateTime, Utc};
use rcgen::{PublicKeyData, SigningKey};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::FromDer;

use crate::chain;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::record::CertificateRecord;
use crate::template::CertificateTemplate;
use crate::x509;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    /// Key created for this certificate, which signs itself
    LocalKey,
    /// Issuer's custody key signs for a key generated by a custody request
    DelegatedKey,
}

/// Signature algorithm for a key, honouring the development default
pub fn select_algorithm(
    declared: Option<SignatureAlgorithm>,
    key: &KeySpec,
    config: &EngineConfig,
) -> Result<SignatureAlgorithm, EngineError> {
    let algorithm = match declared {
        Some(algorithm) => algorithm,
        None if config.allow_development_defaults => {
            warn!(
                "No signature algorithm declared, using development default {}",
                SignatureAlgorithm::DEVELOPMENT_DEFAULT
            );
            SignatureAlgorithm::DEVELOPMENT_DEFAULT
        }
        None => {
            return Err(EngineError::Configuration(
                "no signature algorithm declared".to_string(),
            ))
        }
    };

    if !algorithm.is_compatible_with(key) {
        return Err(EngineError::Configuration(format!(
            "{} cannot sign with a {} key",
            algorithm, key
        )));
    }
    Ok(algorithm)
}

/// Custody key name for a self-issued template
pub fn root_key_name(template: &CertificateTemplate) -> String {
    template.key_storage_path.clone().unwrap_or_else(|| {
        format!(
            "{}-{}",
            template.usage.slug(),
            template.id().value().simple()
        )
    })
}

/// Public key carried by a PKCS#10 request
pub fn public_key_from_csr(der: &[u8], expected: KeySpec) -> Result<PublicKey, EngineError> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| EngineError::Codec(format!("invalid certificate request: {}", e)))?;
    let spki = &csr.certification_request_info.subject_pki;

    let oid = &spki.algorithm.algorithm;
    let key_type = if *oid == OID_PKCS1_RSAENCRYPTION {
        KeyType::Rsa
    } else if *oid == OID_KEY_TYPE_EC_PUBLIC_KEY {
        KeyType::Ec
    } else {
        return Err(EngineError::Codec(format!(
            "unsupported public key algorithm {}",
            oid
        )));
    };
    if key_type != expected.key_type() {
        return Err(EngineError::Configuration(format!(
            "certificate request carries a {:?} key, expected {}",
            key_type, expected
        )));
    }

    Ok(PublicKey::new(expected, spki.subject_public_key.data.to_vec()))
}

/// Issuer certificate used for chained issuance
#[derive(Debug, Clone)]
pub struct IssuerCertificate {
    /// Latest alias of the issuer template
    pub record: CertificateRecord,
    pub der: Vec<u8>,
    pub pem_chain: String,
}

/// Outstanding key custody request for the certificate being issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub name: String,
    pub id: String,
}

pub struct ResolvedSigner {
    kind: SignerKind,
    custody: Arc<dyn KeyCustody>,
    key: KeyHandle,
    algorithm: SignatureAlgorithm,
    subject_public_key: PublicKey,
    issuer: Option<IssuerCertificate>,
    pending: Option<PendingRequest>,
}

impl ResolvedSigner {
    pub fn kind(&self) -> SignerKind {
        self.kind
    }

    /// Public key of the certificate being issued
    pub fn public_key(&self) -> &PublicKey {
        &self.subject_public_key
    }

    /// Custody key producing the signature
    pub fn signing_key(&self) -> &KeyHandle {
        &self.key
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// `None` for self-issued certificates
    pub fn issuer(&self) -> Option<&IssuerCertificate> {
        self.issuer.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, EngineError> {
        Ok(self
            .custody
            .sign(&self.key.reference, self.algorithm, message)
            .await?)
    }

    /// rcgen signing key bound to `runtime`
    pub fn bridge(&self, runtime: Handle) -> CustodySigningKey {
        CustodySigningKey {
            custody: self.custody.clone(),
            key: self.key.reference.clone(),
            public_key: self.key.public_key.clone(),
            algorithm: self.algorithm,
            runtime,
            failure: Arc::new(Mutex::new(None)),
        }
    }
}

impl std::fmt::Debug for ResolvedSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSigner")
            .field("kind", &self.kind)
            .field("key", &self.key.reference)
            .field("algorithm", &self.algorithm)
            .field("pending", &self.pending)
            .finish()
    }
}

/// rcgen [`SigningKey`] that signs through key custody
///
/// rcgen calls `sign` synchronously, so the encode must run on a thread that
/// may block (`spawn_blocking`); the custody call is driven on `runtime`.
pub struct CustodySigningKey {
    custody: Arc<dyn KeyCustody>,
    key: KeyReference,
    public_key: PublicKey,
    algorithm: SignatureAlgorithm,
    runtime: Handle,
    failure: Arc<Mutex<Option<KeyCustodyError>>>,
}

impl CustodySigningKey {
    /// Slot receiving the custody error behind a failed signature
    pub fn failure_slot(&self) -> Arc<Mutex<Option<KeyCustodyError>>> {
        self.failure.clone()
    }
}

impl PublicKeyData for CustodySigningKey {
    fn der_bytes(&self) -> &[u8] {
        &self.public_key.raw
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.algorithm.rcgen()
    }
}

impl SigningKey for CustodySigningKey {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        debug!("Signing {} bytes with {}", msg.len(), self.key);
        match self
            .runtime
            .block_on(self.custody.sign(&self.key, self.algorithm, msg))
        {
            Ok(signature) => Ok(signature),
            Err(e) => {
                warn!("Key custody refused to sign with {}: {}", self.key, e);
                if let Ok(mut slot) = self.failure.lock() {
                    *slot = Some(e);
                }
                Err(rcgen::Error::RemoteKeyError)
            }
        }
    }
}

/// Resolves the signer for a template
#[derive(Clone)]
pub struct SignerResolver {
    config: Arc<EngineConfig>,
    documents: Arc<dyn DocumentStore>,
    content: Arc<dyn ContentStore>,
    custody: Arc<dyn KeyCustody>,
}

impl SignerResolver {
    pub fn new(
        config: Arc<EngineConfig>,
        documents: Arc<dyn DocumentStore>,
        content: Arc<dyn ContentStore>,
        custody: Arc<dyn KeyCustody>,
    ) -> Self {
        Self {
            config,
            documents,
            content,
            custody,
        }
    }

    /// `common_name` is the rendered subject CN, used for the custody request
    pub async fn resolve(
        &self,
        template: &CertificateTemplate,
        common_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedSigner, EngineError> {
        if template.is_self_issued() {
            self.resolve_local(template).await
        } else {
            self.resolve_delegated(template, common_name, now).await
        }
    }

    async fn resolve_local(
        &self,
        template: &CertificateTemplate,
    ) -> Result<ResolvedSigner, EngineError> {
        let spec = template.key_properties.key;
        let algorithm = select_algorithm(template.key_properties.algorithm, &spec, &self.config)?;
        let name = root_key_name(template);

        let reusable = if template.key_properties.reuse_key {
            match self.custody.get_key(&name, None).await {
                Ok(key) if key.public_key.spec == spec => Some(key),
                Ok(_) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        let key = match reusable {
            Some(key) => {
                debug!("Reusing custody key {}", key.reference);
                key
            }
            None => {
                let key = self.custody.create_key(&name, &spec).await?;
                info!("Created custody key {} ({})", key.reference, spec);
                key
            }
        };

        Ok(ResolvedSigner {
            kind: SignerKind::LocalKey,
            custody: self.custody.clone(),
            subject_public_key: key.public_key.clone(),
            key,
            algorithm,
            issuer: None,
            pending: None,
        })
    }

    async fn resolve_delegated(
        &self,
        template: &CertificateTemplate,
        common_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedSigner, EngineError> {
        let alias_id = CertificateRecord::latest_alias_id(&template.issuer_template_id);
        let issuer: CertificateRecord = self
            .documents
            .read(template.issuer_namespace_id, &alias_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    EngineError::NotFound(format!(
                        "issuer template {} has no certificate",
                        template.issuer_template_id
                    ))
                } else {
                    e.into()
                }
            })?;
        if !issuer.usage.is_ca() {
            return Err(EngineError::Configuration(format!(
                "issuer certificate {} is not a CA",
                issuer.certificate_id()
            )));
        }
        if !issuer.is_active_at(now) {
            return Err(EngineError::NotFound(format!(
                "issuer certificate {} is not active",
                issuer.certificate_id()
            )));
        }

        let blob = self.content.get(&issuer.blob_path).await?;
        let pem_chain = String::from_utf8(blob)
            .map_err(|e| EngineError::Codec(format!("issuer chain is not PEM: {}", e)))?;
        let der = chain::leaf_certificate(&pem_chain)?;
        let summary = x509::inspect(&der)?;
        if !summary.profile.is_ca {
            return Err(EngineError::Configuration(format!(
                "issuer certificate {} lacks the CA flag",
                issuer.certificate_id()
            )));
        }

        let path = template.key_storage_path.as_deref().ok_or_else(|| {
            EngineError::Configuration(
                "not implemented for non-key-vault distribution".to_string(),
            )
        })?;
        let issuer_key = issuer.key.key_id.clone().ok_or_else(|| {
            EngineError::NotFound(format!(
                "issuer certificate {} has no custody key",
                issuer.certificate_id()
            ))
        })?;

        let policy = CertificatePolicy {
            common_name: common_name.to_string(),
            key: template.key_properties.key,
            reuse_key: template.key_properties.reuse_key,
        };
        let (key, pending) = tokio::try_join!(
            async {
                self.custody
                    .get_key(&issuer_key.name, Some(&issuer_key.version))
                    .await
                    .map_err(EngineError::from)
            },
            async {
                self.custody
                    .create_certificate(path, &policy)
                    .await
                    .map_err(EngineError::from)
            },
        )?;

        if key.public_key.raw != summary.public_key {
            return Err(EngineError::Configuration(format!(
                "custody key {} does not match issuer certificate {}",
                key.reference,
                issuer.certificate_id()
            )));
        }
        let algorithm = select_algorithm(issuer.key.algorithm, &key.public_key.spec, &self.config)?;
        let subject_public_key = public_key_from_csr(&pending.csr_der, template.key_properties.key)?;
        debug!(
            "Delegating signature to {} for pending request {}",
            key.reference, pending.id
        );

        Ok(ResolvedSigner {
            kind: SignerKind::DelegatedKey,
            custody: self.custody.clone(),
            key,
            algorithm,
            subject_public_key,
            issuer: Some(IssuerCertificate {
                record: issuer,
                der,
                pem_chain,
            }),
            pending: Some(PendingRequest {
                name: path.to_string(),
                id: pending.id,
            }),
        })
    }
}
