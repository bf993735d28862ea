//! End-to-end issuance through the pipeline: roots, chained CAs and leaves

mod common;

use certward_engine::chain::split_chain;
use certward_engine::x509::{inspect, ExtendedKeyUsageFlag, KeyUsageFlag};
use certward_engine::{CertificateRecord, CertificateUsage, EngineError, NamespaceKind};
use certward_keys::{KeyCustody, SignatureAlgorithm};
use certward_store::{ContentStore, Document, DocumentKind, DocumentStoreExt};
use common::{Harness, SERVICE_FQDN};
use std::collections::BTreeSet;
use x509_parser::prelude::parse_x509_certificate;

#[tokio::test(flavor = "multi_thread")]
async fn test_root_is_self_signed_ca() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let root = harness.root_template();

    let issued = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &harness.context(), None)
        .await
        .expect("Failed to issue root");

    let certs = split_chain(&issued.pem_chain).unwrap();
    assert_eq!(certs.len(), 1);

    let summary = inspect(&certs[0]).unwrap();
    assert!(summary.is_self_issued());
    assert!(summary.subject.contains("Certward Test Root CA"));
    assert!(summary.profile.is_ca);
    assert_eq!(summary.profile.path_len, Some(1));

    let (_, cert) = parse_x509_certificate(&certs[0]).unwrap();
    cert.verify_signature(None)
        .expect("Root signature should verify with its own key");

    let record = &issued.record;
    assert!(record.is_self_signed());
    assert_eq!(record.issuer_certificate_id, record.id());
    assert_eq!(record.subject, "CN=Certward Test Root CA, O=Certward");
    assert_eq!(record.subject, summary.subject);
    assert_eq!(record.subject_base, record.subject);
    assert_eq!(record.key.signature_algorithm, SignatureAlgorithm::ES384);
    assert_eq!(record.key.thumbprint_sha1.len(), 40);
    assert_eq!(record.key.thumbprint_sha256.len(), 64);
    assert_eq!(record.serial_number, summary.serial_number);
    assert!(record.key.key_id.is_some());
    assert!(record.supersedes.is_none());

    // Validity follows the template
    assert_eq!(record.not_before, summary.not_before);
    let months = (record.not_after - record.not_before).num_days() / 30;
    assert!((119..=122).contains(&months));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_alias_points_at_issued_record() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let root = harness.root_template();

    let issued = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &harness.context(), None)
        .await
        .expect("Failed to issue root");

    let alias_id = CertificateRecord::latest_alias_id(&root.id());
    let alias: CertificateRecord = harness
        .documents
        .read(harness.root_ns, &alias_id)
        .await
        .expect("Alias should exist");
    assert_eq!(alias.alias_id, Some(issued.record.id()));
    assert_eq!(alias, issued.alias);

    let record: CertificateRecord = harness
        .documents
        .read(harness.root_ns, &issued.record.id())
        .await
        .expect("Record should exist");
    assert_eq!(record, issued.record);
    assert_eq!(alias.serial_number, record.serial_number);
    assert_eq!(alias.not_after, record.not_after);

    let blob = harness.content.get(&record.blob_path).await.unwrap();
    assert_eq!(String::from_utf8(blob).unwrap(), issued.pem_chain);
    assert_eq!(
        record.blob_path,
        format!("{}/{}.pem", harness.root_ns, record.id().value())
    );

    assert_eq!(harness.documents.count_kind(DocumentKind::Certificate), 1);
    assert_eq!(
        harness.documents.count_kind(DocumentKind::LatestCertificateAlias),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intermediate_chains_to_root() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let ctx = harness.context();
    let root = harness.root_template();
    let intermediate = harness.intermediate_template(&root);

    let root_issued = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &ctx, None)
        .await
        .expect("Failed to issue root");
    let issued = pipeline
        .issue(
            NamespaceKind::IntermediateCa,
            harness.intermediate_ns,
            &intermediate,
            &ctx,
            None,
        )
        .await
        .expect("Failed to issue intermediate");

    let certs = split_chain(&issued.pem_chain).unwrap();
    assert_eq!(certs.len(), 2, "chain should hold intermediate then root");
    let root_certs = split_chain(&root_issued.pem_chain).unwrap();
    assert_eq!(certs[1], root_certs[0]);

    let leaf = inspect(&certs[0]).unwrap();
    let issuer = inspect(&certs[1]).unwrap();
    assert_eq!(leaf.issuer, issuer.subject);
    assert!(leaf.subject.contains("Certward Test Intermediate CA"));
    assert!(leaf.profile.is_ca);
    assert_eq!(leaf.profile.path_len, Some(0));

    let (_, root_cert) = parse_x509_certificate(&certs[1]).unwrap();
    let (_, cert) = parse_x509_certificate(&certs[0]).unwrap();
    cert.verify_signature(Some(root_cert.public_key()))
        .expect("Intermediate should be signed by the root key");

    let record = &issued.record;
    assert_eq!(record.issuer_namespace_id, harness.root_ns);
    assert_eq!(record.issuer_certificate_id, root_issued.record.id());
    assert_eq!(record.key.signature_algorithm, SignatureAlgorithm::ES384);
    assert!(record.key.secret_id.is_some());

    // The custody request was completed with the full chain
    let merged = harness
        .custody
        .merged_chain("intermediate-ca")
        .expect("Chain should be merged into custody");
    assert_eq!(merged, certs);
    assert_eq!(harness.custody.pending_requests(), 0);

    let key = record.key.key_id.clone().expect("Custody key id");
    assert_eq!(key.name, "intermediate-ca");
    let handle = harness
        .custody
        .get_key(&key.name, Some(&key.version))
        .await
        .unwrap();
    assert_eq!(handle.public_key.raw, leaf.public_key);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leaf_renders_subject_and_chain() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let ctx = harness.context();
    let root = harness.root_template();
    let intermediate = harness.intermediate_template(&root);
    let leaf = harness.leaf_template(&intermediate, CertificateUsage::ServerOnly, "api-server");

    pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &ctx, None)
        .await
        .unwrap();
    pipeline
        .issue(
            NamespaceKind::IntermediateCa,
            harness.intermediate_ns,
            &intermediate,
            &ctx,
            None,
        )
        .await
        .unwrap();
    let issued = pipeline
        .issue(NamespaceKind::ServicePrincipal, harness.service_ns, &leaf, &ctx, None)
        .await
        .expect("Failed to issue leaf");

    assert_eq!(split_chain(&issued.pem_chain).unwrap().len(), 3);

    let record = &issued.record;
    assert_eq!(record.subject, format!("CN={}", SERVICE_FQDN));
    assert_eq!(record.subject_base, "CN=${request.fqdn}");
    assert_eq!(record.subject_alternative_names.dns_names, vec![SERVICE_FQDN]);
    assert_eq!(
        record.subject_alternative_names_base.dns_names,
        vec!["${request.fqdn}"]
    );
    assert_eq!(record.key.signature_algorithm, SignatureAlgorithm::ES256);

    let certs = split_chain(&issued.pem_chain).unwrap();
    let (_, cert) = parse_x509_certificate(&certs[0]).unwrap();
    let san = cert
        .subject_alternative_name()
        .unwrap()
        .expect("SAN extension");
    assert_eq!(san.value.general_names.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_usage_extensions_round_trip() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let ctx = harness.context();
    let root = harness.root_template();
    let intermediate = harness.intermediate_template(&root);

    let root_issued = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &ctx, None)
        .await
        .unwrap();
    let intermediate_issued = pipeline
        .issue(
            NamespaceKind::IntermediateCa,
            harness.intermediate_ns,
            &intermediate,
            &ctx,
            None,
        )
        .await
        .unwrap();

    let ca_usage = BTreeSet::from([
        KeyUsageFlag::DigitalSignature,
        KeyUsageFlag::KeyCertSign,
        KeyUsageFlag::CrlSign,
    ]);
    let leaf_usage = BTreeSet::from([
        KeyUsageFlag::DigitalSignature,
        KeyUsageFlag::KeyEncipherment,
        KeyUsageFlag::DataEncipherment,
    ]);

    for issued in [&root_issued, &intermediate_issued] {
        let summary = inspect(&split_chain(&issued.pem_chain).unwrap()[0]).unwrap();
        assert!(summary.profile.is_ca);
        assert_eq!(summary.profile.key_usage, ca_usage);
        assert!(summary.profile.extended_key_usage.is_empty());
    }

    let cases = [
        (
            CertificateUsage::ServerOnly,
            "server-only",
            BTreeSet::from([ExtendedKeyUsageFlag::ServerAuth]),
        ),
        (
            CertificateUsage::ClientOnly,
            "client-only",
            BTreeSet::from([ExtendedKeyUsageFlag::ClientAuth]),
        ),
        (
            CertificateUsage::ServerAndClient,
            "server-and-client",
            BTreeSet::from([
                ExtendedKeyUsageFlag::ServerAuth,
                ExtendedKeyUsageFlag::ClientAuth,
            ]),
        ),
    ];
    for (usage, path, expected_eku) in cases {
        let template = harness.leaf_template(&intermediate, usage, path);
        let issued = pipeline
            .issue(NamespaceKind::ServicePrincipal, harness.service_ns, &template, &ctx, None)
            .await
            .unwrap_or_else(|e| panic!("Failed to issue {}: {}", usage, e));

        let summary = inspect(&split_chain(&issued.pem_chain).unwrap()[0]).unwrap();
        assert!(!summary.profile.is_ca, "{} must not be a CA", usage);
        assert_eq!(summary.profile.key_usage, leaf_usage, "{}", usage);
        assert_eq!(summary.profile.extended_key_usage, expected_eku, "{}", usage);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rsa_root_with_development_default() {
    let harness = Harness::new();
    let config = harness.config().with_development_defaults(true);
    let pipeline = certward_engine::Pipeline::new(
        config,
        std::sync::Arc::new(harness.documents.clone()),
        std::sync::Arc::new(harness.content.clone()),
        harness.custody.clone(),
    );

    let mut root = harness.root_template();
    root.key_properties.algorithm = None;
    root.key_properties.key = certward_keys::KeySpec::Rsa { size: 2048 };

    let issued = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &harness.context(), None)
        .await
        .expect("Failed to issue RSA root");
    assert_eq!(issued.record.key.signature_algorithm, SignatureAlgorithm::RS384);
    assert_eq!(issued.record.key.algorithm, None);

    let certs = split_chain(&issued.pem_chain).unwrap();
    let (_, cert) = parse_x509_certificate(&certs[0]).unwrap();
    cert.verify_signature(None).expect("RSA root should verify");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chained_issue_requires_key_storage_path() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let ctx = harness.context();
    let root = harness.root_template();
    pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &ctx, None)
        .await
        .unwrap();

    let mut intermediate = harness.intermediate_template(&root);
    intermediate.key_storage_path = None;

    let err = pipeline
        .issue(
            NamespaceKind::IntermediateCa,
            harness.intermediate_ns,
            &intermediate,
            &ctx,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(err.to_string().contains("non-key-vault"));
    assert_eq!(harness.documents.count_kind(DocumentKind::Certificate), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chained_issue_without_issuer_certificate() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let root = harness.root_template();
    let intermediate = harness.intermediate_template(&root);

    let err = pipeline
        .issue(
            NamespaceKind::IntermediateCa,
            harness.intermediate_ns,
            &intermediate,
            &harness.context(),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(harness.documents.is_empty());
    assert!(harness.content.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_rendered_common_name_is_rejected() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let mut root = harness.root_template();
    root.subject.common_name = "${unknown.variable}".to_string();

    let err = pipeline
        .issue(NamespaceKind::RootCa, harness.root_ns, &root, &harness.context(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(harness.documents.is_empty());
}
