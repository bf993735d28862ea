//! Shared fixtures: a three-level hierarchy over in-memory stores
#![allow(dead_code)]

use certward_engine::{
    CertificateSubject, CertificateTemplate, CertificateUsage, EngineConfig, KeyProperties,
    Pipeline, RenderContext, SubjectAlternativeNames,
};
use certward_keys::{EllipticCurve, KeyCustody, KeySpec, LocalKeyCustody, SignatureAlgorithm};
use certward_store::{ContentStore, Document, DocumentStore, MemoryContentStore, MemoryDocumentStore};
use std::sync::Arc;
use uuid::Uuid;

pub const SERVICE_FQDN: &str = "api.certward.test";

pub fn p256() -> KeyProperties {
    KeyProperties::new(
        SignatureAlgorithm::ES256,
        KeySpec::Ec {
            curve: EllipticCurve::P256,
        },
    )
}

pub fn p384() -> KeyProperties {
    KeyProperties::new(
        SignatureAlgorithm::ES384,
        KeySpec::Ec {
            curve: EllipticCurve::P384,
        },
    )
}

pub struct Harness {
    pub root_ns: Uuid,
    pub intermediate_ns: Uuid,
    pub service_ns: Uuid,
    pub documents: MemoryDocumentStore,
    pub content: MemoryContentStore,
    pub custody: Arc<LocalKeyCustody>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            root_ns: Uuid::new_v4(),
            intermediate_ns: Uuid::new_v4(),
            service_ns: Uuid::new_v4(),
            documents: MemoryDocumentStore::new(),
            content: MemoryContentStore::new(),
            custody: Arc::new(LocalKeyCustody::in_memory()),
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_root_ca_namespace(self.root_ns)
            .with_intermediate_ca_namespace(self.intermediate_ns)
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(
            Arc::new(self.documents.clone()),
            Arc::new(self.content.clone()),
            self.custody.clone(),
        )
    }

    pub fn pipeline_with(
        &self,
        documents: Arc<dyn DocumentStore>,
        content: Arc<dyn ContentStore>,
        custody: Arc<dyn KeyCustody>,
    ) -> Pipeline {
        Pipeline::new(self.config(), documents, content, custody)
    }

    pub fn context(&self) -> RenderContext {
        RenderContext::new()
            .with_request_fqdn(SERVICE_FQDN)
            .with_service_principal_uri("urn:certward:sp:api")
    }

    pub fn root_template(&self) -> CertificateTemplate {
        CertificateTemplate::new(
            self.root_ns,
            "Test Root",
            CertificateUsage::RootCa,
            CertificateSubject::new("Certward Test Root CA").with_organization("Certward"),
            p384(),
        )
        .with_validity_months(120)
    }

    pub fn intermediate_template(&self, root: &CertificateTemplate) -> CertificateTemplate {
        CertificateTemplate::new(
            self.intermediate_ns,
            "Test Intermediate",
            CertificateUsage::IntermediateCa,
            CertificateSubject::new("Certward Test Intermediate CA").with_organization("Certward"),
            p256(),
        )
        .issued_by(root.namespace_id(), root.id())
        .with_key_storage_path("intermediate-ca")
        .with_validity_months(60)
    }

    pub fn leaf_template(
        &self,
        intermediate: &CertificateTemplate,
        usage: CertificateUsage,
        key_storage_path: &str,
    ) -> CertificateTemplate {
        CertificateTemplate::new(
            self.service_ns,
            format!("Service {}", usage),
            usage,
            CertificateSubject::new("${request.fqdn}"),
            p256(),
        )
        .issued_by(intermediate.namespace_id(), intermediate.id())
        .with_subject_alternative_names(
            SubjectAlternativeNames::default()
                .with_dns_name("${request.fqdn}")
                .with_uri("${service_principal.uri}"),
        )
        .with_key_storage_path(key_storage_path)
    }
}
