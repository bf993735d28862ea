//! Certificate construction and signing pipeline
//!
//! `issue` runs strictly in order: render, build, resolve the signer, sign,
//! verify, store the PEM chain, write the record and finally move the latest
//! alias. The alias is only ever written after its record.

use certward_keys::KeyCustody;
use certward_store::{
    certificate_blob_path, ContentStore, Document, DocumentEnvelope, DocumentId, DocumentKind,
    DocumentStore, DocumentStoreExt,
};
use chrono::{DateTime, Months, Utc};
use rcgen::{CertificateParams, Issuer};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chain;
use crate::config::{EngineConfig, NamespaceKind};
use crate::error::EngineError;
use crate::record::{CertificateKeyMetadata, CertificateRecord};
use crate::render::{RenderContext, TemplateRenderer, VariableRenderer};
use crate::signer::{ResolvedSigner, SignerResolver};
use crate::template::CertificateTemplate;
use crate::x509::{self, CertificateDraft, UsageProfile};

/// Result of a successful issuance
#[derive(Debug, Clone)]
pub struct Issued {
    pub record: CertificateRecord,
    pub alias: CertificateRecord,
    /// Leaf first, then the issuer chain
    pub pem_chain: String,
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<EngineConfig>,
    documents: Arc<dyn DocumentStore>,
    content: Arc<dyn ContentStore>,
    custody: Arc<dyn KeyCustody>,
    renderer: Arc<dyn TemplateRenderer>,
    resolver: SignerResolver,
}

impl Pipeline {
    pub fn new(
        config: EngineConfig,
        documents: Arc<dyn DocumentStore>,
        content: Arc<dyn ContentStore>,
        custody: Arc<dyn KeyCustody>,
    ) -> Self {
        let config = Arc::new(config);
        let resolver = SignerResolver::new(
            config.clone(),
            documents.clone(),
            content.clone(),
            custody.clone(),
        );
        Self {
            config,
            documents,
            content,
            custody,
            renderer: Arc::new(VariableRenderer),
            resolver,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Issue a certificate for `template`
    ///
    /// `existing` is the certificate being replaced, recorded as lineage.
    pub async fn issue(
        &self,
        namespace_kind: NamespaceKind,
        namespace_id: Uuid,
        template: &CertificateTemplate,
        context: &RenderContext,
        existing: Option<DocumentId>,
    ) -> Result<Issued, EngineError> {
        if template.namespace_id() != namespace_id {
            return Err(EngineError::Configuration(format!(
                "template {} does not belong to namespace {}",
                template.id(),
                namespace_id
            )));
        }
        if template.is_deleted() {
            return Err(EngineError::Configuration(format!(
                "template {} is deleted",
                template.id()
            )));
        }
        template.validate(namespace_kind, &self.config)?;

        let cert_id = DocumentId::generate(DocumentKind::Certificate);
        if let Some(existing) = existing {
            info!("Renewing {} as {}", existing, cert_id);
        }

        let subject = template.subject.render(self.renderer.as_ref(), context);
        if subject.common_name.is_empty() {
            return Err(EngineError::Configuration(format!(
                "subject common name of template {} rendered empty",
                template.id()
            )));
        }
        let sans = template
            .subject_alternative_names
            .render(self.renderer.as_ref(), context);

        // x509 validity has second precision
        let not_before = DateTime::from_timestamp(Utc::now().timestamp(), 0)
            .ok_or_else(|| EngineError::Codec("current time out of range".to_string()))?;
        let not_after = not_before
            .checked_add_months(Months::new(template.validity_in_months))
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "validity of {} months is out of range",
                    template.validity_in_months
                ))
            })?;

        let params = CertificateDraft {
            subject: &subject,
            sans: &sans,
            usage: template.usage,
            serial: cert_id.value().as_bytes(),
            not_before,
            not_after,
            chained: !template.is_self_issued(),
        }
        .to_params()?;

        let signer = self
            .resolver
            .resolve(template, &subject.common_name, not_before)
            .await?;
        debug!(
            "Signing {} with {:?} signer using {}",
            cert_id,
            signer.kind(),
            signer.signature_algorithm()
        );

        let der = sign(params, &signer).await?;

        let summary = x509::inspect(&der)?;
        if summary.profile != UsageProfile::for_usage(template.usage) {
            return Err(EngineError::Codec(format!(
                "encoded extensions of {} do not match usage {}",
                cert_id, template.usage
            )));
        }

        let leaf_pem = chain::encode_certificate(&der);
        let pem_chain = match signer.issuer() {
            Some(issuer) => chain::join_chain(&leaf_pem, &issuer.pem_chain),
            None => leaf_pem,
        };

        let merged = match signer.pending() {
            Some(pending) => {
                let mut der_chain = vec![der.clone()];
                if let Some(issuer) = signer.issuer() {
                    der_chain.extend(chain::split_chain(&issuer.pem_chain)?);
                }
                let merged = self
                    .custody
                    .merge_certificate(&pending.name, &der_chain)
                    .await?;
                debug!("Merged {} into custody as {}", cert_id, merged.id);
                Some(merged)
            }
            None => None,
        };

        let prints = chain::thumbprints(&der);

        let blob_path = certificate_blob_path(namespace_id, cert_id.value());
        let blob_url = self
            .content
            .put(&blob_path, pem_chain.clone().into_bytes())
            .await?;

        let (certificate_url, key_id, secret_id) = match merged {
            Some(merged) => (merged.id, Some(merged.kid), Some(merged.sid)),
            None => (blob_url.clone(), Some(signer.signing_key().reference.clone()), None),
        };
        let record = CertificateRecord {
            envelope: DocumentEnvelope::new(namespace_id, cert_id),
            template_id: template.id(),
            issuer_namespace_id: template.issuer_namespace_id,
            issuer_certificate_id: signer
                .issuer()
                .map(|issuer| issuer.record.certificate_id())
                .unwrap_or(cert_id),
            alias_id: None,
            supersedes: existing,
            subject: summary.subject,
            subject_base: template.subject.to_string(),
            subject_alternative_names: sans,
            subject_alternative_names_base: template.subject_alternative_names.clone(),
            serial_number: summary.serial_number,
            not_before: summary.not_before,
            not_after: summary.not_after,
            usage: template.usage,
            blob_path,
            blob_url,
            key: CertificateKeyMetadata {
                algorithm: template.key_properties.algorithm,
                key: template.key_properties.key,
                signature_algorithm: signer.signature_algorithm(),
                thumbprint_sha1: prints.sha1,
                thumbprint_sha256: prints.sha256,
                certificate_url,
                key_id,
                secret_id,
            },
        };

        self.documents.write(&record).await?;
        info!(
            "Issued certificate {} for template {} ({}), valid until {}",
            record.id(),
            template.id(),
            record.subject,
            record.not_after
        );

        let alias = self.publish_alias(&record).await?;

        Ok(Issued {
            record,
            alias,
            pem_chain,
        })
    }

    /// Point the template's latest alias at `record`
    ///
    /// Safe to repeat; used to finish an issuance that returned
    /// [`EngineError::AliasPending`].
    pub async fn publish_alias(
        &self,
        record: &CertificateRecord,
    ) -> Result<CertificateRecord, EngineError> {
        if record.is_alias() {
            return Err(EngineError::Configuration(format!(
                "{} is already an alias",
                record.id()
            )));
        }

        let alias = record.to_latest_alias();
        match self.documents.write(&alias).await {
            Ok(()) => {
                info!("Latest certificate for {} is now {}", record.template_id, record.id());
                Ok(alias)
            }
            Err(source) => {
                warn!(
                    "Certificate {} stored but alias {} not updated: {}",
                    record.id(),
                    alias.id(),
                    source
                );
                Err(EngineError::AliasPending {
                    record: Box::new(record.clone()),
                    source,
                })
            }
        }
    }
}

/// Encode and sign on the blocking pool; rcgen drives custody signatures
async fn sign(params: CertificateParams, signer: &ResolvedSigner) -> Result<Vec<u8>, EngineError> {
    let signing_key = signer.bridge(Handle::current());
    let failure = signing_key.failure_slot();
    let subject_key = signer.public_key().clone();
    let issuer_pem = signer
        .issuer()
        .map(|issuer| chain::encode_certificate(&issuer.der));

    let signed = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, rcgen::Error> {
        let cert = match issuer_pem {
            None => params.self_signed(&signing_key)?,
            Some(pem) => {
                let issuer = Issuer::from_ca_cert_pem(&pem, signing_key)?;
                params.signed_by(&subject_key, &issuer)?
            }
        };
        Ok(cert.der().to_vec())
    })
    .await
    .map_err(|e| EngineError::Remote(format!("signing task failed: {}", e)))?;

    signed.map_err(|e| {
        let custody_error = failure.lock().ok().and_then(|mut slot| slot.take());
        match custody_error {
            Some(custody_error) => EngineError::from(custody_error),
            None => EngineError::from(e),
        }
    })
}
