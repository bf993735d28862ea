//! Software key custody for development and tests
//!
//! Holds PKCS#8 keys in process memory, optionally mirrored to a directory so
//! a development CA survives restarts. **DO NOT use in production** - issuer
//! keys belong in an HSM-backed vault.

use async_trait::async_trait;
use aws_lc_rs::encoding::{AsDer, Pkcs8V1Der};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rcgen::{CertificateParams, DistinguishedName, DnType, SigningKey};
use rustls_pki_types::PrivatePkcs8KeyDer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::algorithm::{KeySpec, PublicKey, SignatureAlgorithm};
use crate::custody::{
    validate_key_name, CertificatePolicy, KeyCustody, KeyHandle, KeyReference, MergedCertificate,
    PendingCertificate,
};
use crate::error::KeyCustodyError;

#[derive(Clone)]
struct StoredKey {
    version: String,
    spec: KeySpec,
    created: DateTime<Utc>,
    pkcs8: Vec<u8>,
    public_raw: Vec<u8>,
}

impl StoredKey {
    fn handle(&self, name: &str) -> KeyHandle {
        KeyHandle {
            reference: KeyReference::new(name, &self.version),
            public_key: PublicKey::new(self.spec, self.public_raw.clone()),
        }
    }
}

/// On-disk form of a key version
#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: String,
    spec: KeySpec,
    created: DateTime<Utc>,
    pkcs8: String,
}

struct PendingRequest {
    id: String,
    version: String,
}

fn new_version() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn load_key_pair(
    pkcs8: &[u8],
    algorithm: SignatureAlgorithm,
) -> Result<rcgen::KeyPair, KeyCustodyError> {
    let der = PrivatePkcs8KeyDer::from(pkcs8);
    Ok(rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
        &der,
        algorithm.rcgen(),
    )?)
}

fn generate_key(spec: &KeySpec) -> Result<rcgen::KeyPair, KeyCustodyError> {
    match spec {
        KeySpec::Ec { .. } => Ok(rcgen::KeyPair::generate_for(
            spec.natural_algorithm().rcgen(),
        )?),
        KeySpec::Rsa { size } => {
            let key_size = match size {
                2048 => aws_lc_rs::rsa::KeySize::Rsa2048,
                3072 => aws_lc_rs::rsa::KeySize::Rsa3072,
                4096 => aws_lc_rs::rsa::KeySize::Rsa4096,
                other => {
                    return Err(KeyCustodyError::Unsupported(format!(
                        "RSA key size {}",
                        other
                    )))
                }
            };
            let key = aws_lc_rs::rsa::KeyPair::generate(key_size)
                .map_err(|_| KeyCustodyError::Crypto("RSA key generation failed".to_string()))?;
            let der: Pkcs8V1Der<'static> = key
                .as_der()
                .map_err(|_| KeyCustodyError::Crypto("RSA key encoding failed".to_string()))?;
            load_key_pair(der.as_ref(), spec.natural_algorithm())
        }
    }
}

/// In-process key custody
#[derive(Default)]
pub struct LocalKeyCustody {
    /// Key versions per name, oldest first
    keys: DashMap<String, Vec<StoredKey>>,
    pending: DashMap<String, PendingRequest>,
    merged: DashMap<String, Vec<Vec<u8>>>,
    dir: Option<PathBuf>,
}

impl LocalKeyCustody {
    /// Custody whose keys vanish with the process
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Custody persisted under `dir`, loading any keys already there
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, KeyCustodyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let custody = Self {
            dir: Some(dir.clone()),
            ..Self::default()
        };

        let mut names = fs::read_dir(&dir).await?;
        while let Some(entry) = names.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_key_name(&name).is_err() {
                continue;
            }

            let mut versions = Self::load_versions(&entry.path()).await?;
            versions.sort_by_key(|key| key.created);
            if !versions.is_empty() {
                custody.keys.insert(name, versions);
            }
        }

        info!(
            "Opened local key custody at {:?} ({} keys)",
            dir,
            custody.keys.len()
        );
        Ok(custody)
    }

    async fn load_versions(path: &Path) -> Result<Vec<StoredKey>, KeyCustodyError> {
        let mut versions = Vec::new();
        let mut files = fs::read_dir(path).await?;
        while let Some(file) = files.next_entry().await? {
            if file.path().extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let content = fs::read(file.path()).await?;
            let key_file: KeyFile = serde_json::from_slice(&content)
                .map_err(|e| KeyCustodyError::Backend(format!("corrupt key file: {}", e)))?;
            let pkcs8 = BASE64
                .decode(key_file.pkcs8.as_bytes())
                .map_err(|e| KeyCustodyError::Backend(format!("corrupt key file: {}", e)))?;
            let key_pair = load_key_pair(&pkcs8, key_file.spec.natural_algorithm())?;

            versions.push(StoredKey {
                version: key_file.version,
                spec: key_file.spec,
                created: key_file.created,
                public_raw: key_pair.public_key_raw().to_vec(),
                pkcs8,
            });
        }
        Ok(versions)
    }

    async fn persist(&self, name: &str, key: &StoredKey) -> Result<(), KeyCustodyError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let key_dir = dir.join(name);
        fs::create_dir_all(&key_dir).await?;

        let key_file = KeyFile {
            version: key.version.clone(),
            spec: key.spec,
            created: key.created,
            pkcs8: BASE64.encode(&key.pkcs8),
        };
        let bytes = serde_json::to_vec_pretty(&key_file)
            .map_err(|e| KeyCustodyError::Backend(e.to_string()))?;
        fs::write(key_dir.join(format!("{}.json", key.version)), bytes).await?;
        Ok(())
    }

    async fn add_version(&self, name: &str, spec: &KeySpec) -> Result<StoredKey, KeyCustodyError> {
        validate_key_name(name)?;
        if !spec.is_supported() {
            return Err(KeyCustodyError::Unsupported(spec.to_string()));
        }

        let key_pair = generate_key(spec)?;
        let key = StoredKey {
            version: new_version(),
            spec: *spec,
            created: Utc::now(),
            pkcs8: key_pair.serialize_der(),
            public_raw: key_pair.public_key_raw().to_vec(),
        };

        self.persist(name, &key).await?;
        self.keys
            .entry(name.to_string())
            .or_default()
            .push(key.clone());

        debug!("Created key {}/{} ({})", name, key.version, spec);
        Ok(key)
    }

    fn find(&self, name: &str, version: Option<&str>) -> Result<StoredKey, KeyCustodyError> {
        let versions = self
            .keys
            .get(name)
            .ok_or_else(|| KeyCustodyError::KeyNotFound(name.to_string()))?;

        let found = match version {
            Some(version) => versions.iter().find(|key| key.version == version),
            None => versions.last(),
        };

        found.cloned().ok_or_else(|| {
            KeyCustodyError::KeyNotFound(format!("{}/{}", name, version.unwrap_or("latest")))
        })
    }

    /// Number of certificate requests awaiting a merge
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Chain most recently merged under `name`
    pub fn merged_chain(&self, name: &str) -> Option<Vec<Vec<u8>>> {
        self.merged.get(name).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for LocalKeyCustody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyCustody")
            .field("keys", &self.keys.len())
            .field("pending", &self.pending.len())
            .field("dir", &self.dir)
            .finish()
    }
}

#[async_trait]
impl KeyCustody for LocalKeyCustody {
    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<KeyHandle, KeyCustodyError> {
        let key = self.add_version(name, spec).await?;
        Ok(key.handle(name))
    }

    async fn get_key(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<KeyHandle, KeyCustodyError> {
        Ok(self.find(name, version)?.handle(name))
    }

    async fn sign(
        &self,
        key: &KeyReference,
        algorithm: SignatureAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>, KeyCustodyError> {
        let stored = self.find(&key.name, Some(&key.version))?;
        if !algorithm.is_compatible_with(&stored.spec) {
            return Err(KeyCustodyError::Unsupported(format!(
                "{} with a {} key",
                algorithm, stored.spec
            )));
        }

        let key_pair = load_key_pair(&stored.pkcs8, algorithm)?;
        Ok(SigningKey::sign(&key_pair, message)?)
    }

    async fn create_certificate(
        &self,
        name: &str,
        policy: &CertificatePolicy,
    ) -> Result<PendingCertificate, KeyCustodyError> {
        let reusable = if policy.reuse_key {
            self.find(name, None)
                .ok()
                .filter(|key| key.spec == policy.key)
        } else {
            None
        };
        let key = match reusable {
            Some(key) => key,
            None => self.add_version(name, &policy.key).await?,
        };

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, policy.common_name.as_str());
        params.distinguished_name = dn;

        let key_pair = load_key_pair(&key.pkcs8, key.spec.natural_algorithm())?;
        let csr = params.serialize_request(&key_pair)?;

        let id = format!("local://certificates/{}/pending/{}", name, key.version);
        self.pending.insert(
            name.to_string(),
            PendingRequest {
                id: id.clone(),
                version: key.version.clone(),
            },
        );

        debug!("Opened certificate request {}", id);
        Ok(PendingCertificate {
            id,
            csr_der: csr.der().to_vec(),
        })
    }

    async fn merge_certificate(
        &self,
        name: &str,
        der_chain: &[Vec<u8>],
    ) -> Result<MergedCertificate, KeyCustodyError> {
        let leaf = der_chain
            .first()
            .ok_or_else(|| KeyCustodyError::Crypto("empty certificate chain".to_string()))?;

        let (version, request_id) = {
            let request = self
                .pending
                .get(name)
                .ok_or_else(|| KeyCustodyError::RequestNotFound(name.to_string()))?;
            (request.version.clone(), request.id.clone())
        };
        let key = self.find(name, Some(&version))?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf)
            .map_err(|e| KeyCustodyError::Crypto(format!("invalid certificate: {}", e)))?;
        if cert.public_key().subject_public_key.data.as_ref() != key.public_raw.as_slice() {
            return Err(KeyCustodyError::Crypto(format!(
                "certificate does not match the key of request {}",
                request_id
            )));
        }

        self.pending.remove(name);
        self.merged.insert(name.to_string(), der_chain.to_vec());

        info!("Merged certificate into {}/{}", name, version);
        Ok(MergedCertificate {
            id: format!("local://certificates/{}/{}", name, version),
            kid: KeyReference::new(name, &version),
            sid: format!("local://secrets/{}/{}", name, version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::EllipticCurve;

    const P256: KeySpec = KeySpec::Ec {
        curve: EllipticCurve::P256,
    };

    #[tokio::test]
    async fn test_create_and_get_latest() {
        let custody = LocalKeyCustody::in_memory();
        let first = custody.create_key("root-ca", &P256).await.unwrap();
        let second = custody.create_key("root-ca", &P256).await.unwrap();
        assert_ne!(first.reference.version, second.reference.version);

        let latest = custody.get_key("root-ca", None).await.unwrap();
        assert_eq!(latest, second);

        let pinned = custody
            .get_key("root-ca", Some(&first.reference.version))
            .await
            .unwrap();
        assert_eq!(pinned, first);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let custody = LocalKeyCustody::in_memory();
        let err = custody.get_key("absent", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_bad_names_and_sizes() {
        let custody = LocalKeyCustody::in_memory();
        assert!(matches!(
            custody.create_key("bad/name", &P256).await,
            Err(KeyCustodyError::InvalidName(_))
        ));
        assert!(matches!(
            custody.create_key("rsa", &KeySpec::Rsa { size: 1024 }).await,
            Err(KeyCustodyError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_checks_algorithm_family() {
        let custody = LocalKeyCustody::in_memory();
        let key = custody.create_key("signer", &P256).await.unwrap();

        let signature = custody
            .sign(&key.reference, SignatureAlgorithm::ES256, b"payload")
            .await
            .unwrap();
        assert!(!signature.is_empty());

        let err = custody
            .sign(&key.reference, SignatureAlgorithm::RS256, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyCustodyError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_create_certificate_returns_parseable_csr() {
        use x509_parser::certification_request::X509CertificationRequest;
        use x509_parser::prelude::FromDer;

        let custody = LocalKeyCustody::in_memory();
        let pending = custody
            .create_certificate(
                "web",
                &CertificatePolicy {
                    common_name: "web.internal".to_string(),
                    key: P256,
                    reuse_key: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(custody.pending_requests(), 1);

        let (_, csr) = X509CertificationRequest::from_der(&pending.csr_der).unwrap();
        let key = custody.get_key("web", None).await.unwrap();
        assert_eq!(
            csr.certification_request_info
                .subject_pki
                .subject_public_key
                .data
                .as_ref(),
            key.public_key.raw.as_slice()
        );
    }

    #[tokio::test]
    async fn test_reuse_key_keeps_version() {
        let custody = LocalKeyCustody::in_memory();
        let existing = custody.create_key("svc", &P256).await.unwrap();

        let policy = CertificatePolicy {
            common_name: "svc".to_string(),
            key: P256,
            reuse_key: true,
        };
        custody.create_certificate("svc", &policy).await.unwrap();
        let latest = custody.get_key("svc", None).await.unwrap();
        assert_eq!(latest.reference, existing.reference);
    }

    #[tokio::test]
    async fn test_merge_without_request_is_not_found() {
        let custody = LocalKeyCustody::in_memory();
        let err = custody
            .merge_certificate("nothing", &[vec![0x30]])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let created = {
            let custody = LocalKeyCustody::open(dir.path()).await.unwrap();
            custody.create_key("persisted", &P256).await.unwrap()
        };

        let reopened = LocalKeyCustody::open(dir.path()).await.unwrap();
        let loaded = reopened.get_key("persisted", None).await.unwrap();
        assert_eq!(loaded, created);

        let signature = reopened
            .sign(&loaded.reference, SignatureAlgorithm::ES256, b"after restart")
            .await
            .unwrap();
        assert!(!signature.is_empty());
    }

    #[tokio::test]
    async fn test_rsa_key_generation() {
        let custody = LocalKeyCustody::in_memory();
        let key = custody
            .create_key("rsa-root", &KeySpec::Rsa { size: 2048 })
            .await
            .unwrap();
        assert_eq!(key.public_key.spec, KeySpec::Rsa { size: 2048 });

        for algorithm in [
            SignatureAlgorithm::RS256,
            SignatureAlgorithm::RS384,
            SignatureAlgorithm::RS512,
        ] {
            let signature = custody
                .sign(&key.reference, algorithm, b"payload")
                .await
                .unwrap();
            assert_eq!(signature.len(), 256);
        }
    }
}
