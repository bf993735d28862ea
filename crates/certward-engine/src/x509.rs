//! Usage-dependent x509 extensions and certificate inspection

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
    SerialNumber,
};
use serde::Serialize;
use std::collections::BTreeSet;
use x509_parser::error::X509Error;
use x509_parser::parse_x509_certificate;
use x509_parser::time::ASN1Time;
use x509_parser::x509::{AttributeTypeAndValue, X509Name};

use crate::chain::hex_lower;
use crate::error::EngineError;
use crate::template::{CertificateSubject, CertificateUsage, SubjectAlternativeNames};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsageFlag {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl KeyUsageFlag {
    fn to_rcgen(self) -> KeyUsagePurpose {
        match self {
            KeyUsageFlag::DigitalSignature => KeyUsagePurpose::DigitalSignature,
            KeyUsageFlag::ContentCommitment => KeyUsagePurpose::ContentCommitment,
            KeyUsageFlag::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
            KeyUsageFlag::DataEncipherment => KeyUsagePurpose::DataEncipherment,
            KeyUsageFlag::KeyAgreement => KeyUsagePurpose::KeyAgreement,
            KeyUsageFlag::KeyCertSign => KeyUsagePurpose::KeyCertSign,
            KeyUsageFlag::CrlSign => KeyUsagePurpose::CrlSign,
            KeyUsageFlag::EncipherOnly => KeyUsagePurpose::EncipherOnly,
            KeyUsageFlag::DecipherOnly => KeyUsagePurpose::DecipherOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtendedKeyUsageFlag {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    Any,
}

/// CA flag and key usage sets a certificate carries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageProfile {
    pub is_ca: bool,
    pub path_len: Option<u8>,
    pub key_usage: BTreeSet<KeyUsageFlag>,
    pub extended_key_usage: BTreeSet<ExtendedKeyUsageFlag>,
}

impl UsageProfile {
    /// Extensions a certificate of `usage` must carry
    pub fn for_usage(usage: CertificateUsage) -> Self {
        let ca_key_usage = || {
            BTreeSet::from([
                KeyUsageFlag::DigitalSignature,
                KeyUsageFlag::KeyCertSign,
                KeyUsageFlag::CrlSign,
            ])
        };
        let leaf_key_usage = BTreeSet::from([
            KeyUsageFlag::DigitalSignature,
            KeyUsageFlag::KeyEncipherment,
            KeyUsageFlag::DataEncipherment,
        ]);

        match usage {
            CertificateUsage::RootCa => Self {
                is_ca: true,
                path_len: Some(1),
                key_usage: ca_key_usage(),
                extended_key_usage: BTreeSet::new(),
            },
            CertificateUsage::IntermediateCa => Self {
                is_ca: true,
                path_len: Some(0),
                key_usage: ca_key_usage(),
                extended_key_usage: BTreeSet::new(),
            },
            CertificateUsage::ServerOnly => Self {
                key_usage: leaf_key_usage,
                extended_key_usage: BTreeSet::from([ExtendedKeyUsageFlag::ServerAuth]),
                ..Default::default()
            },
            CertificateUsage::ClientOnly => Self {
                key_usage: leaf_key_usage,
                extended_key_usage: BTreeSet::from([ExtendedKeyUsageFlag::ClientAuth]),
                ..Default::default()
            },
            CertificateUsage::ServerAndClient => Self {
                key_usage: leaf_key_usage,
                extended_key_usage: BTreeSet::from([
                    ExtendedKeyUsageFlag::ServerAuth,
                    ExtendedKeyUsageFlag::ClientAuth,
                ]),
                ..Default::default()
            },
        }
    }

    fn apply(&self, params: &mut CertificateParams) {
        params.is_ca = match (self.is_ca, self.path_len) {
            (true, Some(len)) => IsCa::Ca(BasicConstraints::Constrained(len)),
            (true, None) => IsCa::Ca(BasicConstraints::Unconstrained),
            (false, _) => IsCa::NoCa,
        };
        params.key_usages = self.key_usage.iter().map(|flag| flag.to_rcgen()).collect();
        params.extended_key_usages = self
            .extended_key_usage
            .iter()
            .map(|flag| match flag {
                ExtendedKeyUsageFlag::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsageFlag::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsageFlag::CodeSigning => ExtendedKeyUsagePurpose::CodeSigning,
                ExtendedKeyUsageFlag::EmailProtection => ExtendedKeyUsagePurpose::EmailProtection,
                ExtendedKeyUsageFlag::TimeStamping => ExtendedKeyUsagePurpose::TimeStamping,
                ExtendedKeyUsageFlag::OcspSigning => ExtendedKeyUsagePurpose::OcspSigning,
                ExtendedKeyUsageFlag::Any => ExtendedKeyUsagePurpose::Any,
            })
            .collect();
    }
}

fn to_offset(at: DateTime<Utc>) -> Result<::time::OffsetDateTime, EngineError> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| EngineError::Codec(format!("validity out of range: {}", e)))
}

/// Everything rcgen needs to encode a certificate except its keys
pub struct CertificateDraft<'a> {
    pub subject: &'a CertificateSubject,
    pub sans: &'a SubjectAlternativeNames,
    pub usage: CertificateUsage,
    pub serial: &'a [u8],
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub chained: bool,
}

impl CertificateDraft<'_> {
    pub fn to_params(&self) -> Result<CertificateParams, EngineError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = self.subject.to_distinguished_name();
        params.subject_alt_names = self.sans.to_san_types()?;
        params.serial_number = Some(SerialNumber::from_slice(self.serial));
        params.not_before = to_offset(self.not_before)?;
        params.not_after = to_offset(self.not_after)?;
        params.use_authority_key_identifier_extension = self.chained;
        UsageProfile::for_usage(self.usage).apply(&mut params);
        Ok(params)
    }
}

/// Fields read back from an encoded certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    /// Lowercase hex
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub profile: UsageProfile,
    #[serde(skip)]
    pub public_key: Vec<u8>,
}

impl CertificateSummary {
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

fn attribute_text(attr: Option<&AttributeTypeAndValue<'_>>) -> Result<Option<String>, EngineError> {
    attr.map(|attr| attr.as_str().map(str::to_string))
        .transpose()
        .map_err(|e| EngineError::Codec(format!("invalid name attribute: {}", e)))
}

/// Name in the same `CN=…, OU=…, O=…, C=…` form templates display
fn readable_name(name: &X509Name<'_>) -> Result<String, EngineError> {
    let subject = CertificateSubject {
        common_name: attribute_text(name.iter_common_name().next())?.unwrap_or_default(),
        organization: attribute_text(name.iter_organization().next())?,
        organizational_unit: attribute_text(name.iter_organizational_unit().next())?,
        country: attribute_text(name.iter_country().next())?,
    };
    Ok(subject.to_string())
}

fn timestamp(at: ASN1Time) -> Result<DateTime<Utc>, EngineError> {
    DateTime::from_timestamp(at.timestamp(), 0)
        .ok_or_else(|| EngineError::Codec("certificate validity out of range".to_string()))
}

/// Parse a DER certificate
pub fn inspect(der: &[u8]) -> Result<CertificateSummary, EngineError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| EngineError::Codec(format!("invalid certificate: {}", e)))?;
    let codec = |e: X509Error| EngineError::Codec(format!("invalid extension: {}", e));

    let mut profile = UsageProfile::default();
    if let Some(bc) = cert.basic_constraints().map_err(codec)? {
        profile.is_ca = bc.value.ca;
        profile.path_len = bc
            .value
            .path_len_constraint
            .and_then(|len| u8::try_from(len).ok());
    }
    if let Some(ku) = cert.key_usage().map_err(codec)? {
        let ku = ku.value;
        let flags = [
            (ku.digital_signature(), KeyUsageFlag::DigitalSignature),
            (ku.non_repudiation(), KeyUsageFlag::ContentCommitment),
            (ku.key_encipherment(), KeyUsageFlag::KeyEncipherment),
            (ku.data_encipherment(), KeyUsageFlag::DataEncipherment),
            (ku.key_agreement(), KeyUsageFlag::KeyAgreement),
            (ku.key_cert_sign(), KeyUsageFlag::KeyCertSign),
            (ku.crl_sign(), KeyUsageFlag::CrlSign),
            (ku.encipher_only(), KeyUsageFlag::EncipherOnly),
            (ku.decipher_only(), KeyUsageFlag::DecipherOnly),
        ];
        profile.key_usage = flags
            .into_iter()
            .filter_map(|(set, flag)| set.then_some(flag))
            .collect();
    }
    if let Some(eku) = cert.extended_key_usage().map_err(codec)? {
        let eku = eku.value;
        let flags = [
            (eku.server_auth, ExtendedKeyUsageFlag::ServerAuth),
            (eku.client_auth, ExtendedKeyUsageFlag::ClientAuth),
            (eku.code_signing, ExtendedKeyUsageFlag::CodeSigning),
            (eku.email_protection, ExtendedKeyUsageFlag::EmailProtection),
            (eku.time_stamping, ExtendedKeyUsageFlag::TimeStamping),
            (eku.ocsp_signing, ExtendedKeyUsageFlag::OcspSigning),
            (eku.any, ExtendedKeyUsageFlag::Any),
        ];
        profile.extended_key_usage = flags
            .into_iter()
            .filter_map(|(set, flag)| set.then_some(flag))
            .collect();
    }

    Ok(CertificateSummary {
        subject: readable_name(cert.subject())?,
        issuer: readable_name(cert.issuer())?,
        serial_number: hex_lower(cert.raw_serial()),
        not_before: timestamp(cert.validity().not_before)?,
        not_after: timestamp(cert.validity().not_after)?,
        profile,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}
