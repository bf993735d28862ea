//! Certificate templates
//!
//! A template is the declarative description of a certificate: who issues
//! it, what key it carries, how its subject is rendered, and when it must be
//! renewed.

use certward_keys::{KeySpec, SignatureAlgorithm};
use certward_store::{Document, DocumentEnvelope, DocumentId, DocumentKind};
use chrono::{DateTime, Duration, Utc};
use rcgen::{DistinguishedName, DnType, SanType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::config::{EngineConfig, NamespaceKind};
use crate::error::EngineError;
use crate::render::{RenderContext, TemplateRenderer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateUsage {
    RootCa,
    IntermediateCa,
    ServerOnly,
    ClientOnly,
    ServerAndClient,
}

impl CertificateUsage {
    pub const ALL: [CertificateUsage; 5] = [
        CertificateUsage::RootCa,
        CertificateUsage::IntermediateCa,
        CertificateUsage::ServerOnly,
        CertificateUsage::ClientOnly,
        CertificateUsage::ServerAndClient,
    ];

    pub fn is_ca(self) -> bool {
        matches!(self, CertificateUsage::RootCa | CertificateUsage::IntermediateCa)
    }

    pub fn slug(self) -> &'static str {
        match self {
            CertificateUsage::RootCa => "root-ca",
            CertificateUsage::IntermediateCa => "intermediate-ca",
            CertificateUsage::ServerOnly => "server-only",
            CertificateUsage::ClientOnly => "client-only",
            CertificateUsage::ServerAndClient => "server-and-client",
        }
    }

    /// Whether a template with this usage may live in a namespace of `kind`
    pub fn allowed_in(self, kind: NamespaceKind) -> bool {
        match self {
            CertificateUsage::RootCa => kind == NamespaceKind::RootCa,
            CertificateUsage::IntermediateCa => kind == NamespaceKind::IntermediateCa,
            CertificateUsage::ServerOnly
            | CertificateUsage::ClientOnly
            | CertificateUsage::ServerAndClient => !kind.is_ca(),
        }
    }
}

impl fmt::Display for CertificateUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// When an issued certificate must be renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifetimeTrigger {
    /// Renew once the certificate is this many days from expiry
    DaysBeforeExpiry(u32),
    /// Renew once this percentage of the validity period has elapsed
    LifetimePercentage(u8),
}

impl LifetimeTrigger {
    /// Instant from which a certificate valid over `[not_before, not_after)`
    /// is due for renewal, `None` when it falls outside the representable range
    pub fn threshold(
        &self,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match *self {
            LifetimeTrigger::DaysBeforeExpiry(days) => {
                not_after.checked_sub_signed(Duration::days(i64::from(days)))
            }
            LifetimeTrigger::LifetimePercentage(pct) => {
                let lifetime = (not_after - not_before).num_milliseconds();
                let elapsed = lifetime.checked_mul(i64::from(pct))? / 100;
                not_before.checked_add_signed(Duration::milliseconds(elapsed))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyProperties {
    /// Signature algorithm this certificate's key signs with
    #[serde(default)]
    pub algorithm: Option<SignatureAlgorithm>,
    pub key: KeySpec,
    #[serde(default)]
    pub reuse_key: bool,
}

impl KeyProperties {
    pub fn new(algorithm: SignatureAlgorithm, key: KeySpec) -> Self {
        Self {
            algorithm: Some(algorithm),
            key,
            reuse_key: false,
        }
    }

    fn validate(&self, config: &EngineConfig) -> Result<(), EngineError> {
        if !self.key.is_supported() {
            return Err(EngineError::Configuration(format!(
                "unsupported key {}",
                self.key
            )));
        }
        match self.algorithm {
            Some(alg) if !alg.is_compatible_with(&self.key) => Err(EngineError::Configuration(
                format!("{} cannot be used with a {} key", alg, self.key),
            )),
            None if !config.allow_development_defaults => Err(EngineError::Configuration(
                "no signature algorithm declared".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Subject name fields, each a template string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSubject {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl CertificateSubject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Render every field; optional fields that render empty are dropped
    pub fn render(&self, renderer: &dyn TemplateRenderer, context: &RenderContext) -> Self {
        let optional = |field: &Option<String>| {
            field
                .as_deref()
                .map(|value| renderer.render(value, context))
                .filter(|value| !value.is_empty())
        };
        Self {
            common_name: renderer.render(&self.common_name, context),
            organization: optional(&self.organization),
            organizational_unit: optional(&self.organizational_unit),
            country: optional(&self.country),
        }
    }

    pub fn to_distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(country) = &self.country {
            dn.push(DnType::CountryName, country.as_str());
        }
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, organization.as_str());
        }
        if let Some(unit) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, unit.as_str());
        }
        dn.push(DnType::CommonName, self.common_name.as_str());
        dn
    }
}

impl fmt::Display for CertificateSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        if let Some(unit) = &self.organizational_unit {
            write!(f, ", OU={}", unit)?;
        }
        if let Some(organization) = &self.organization {
            write!(f, ", O={}", organization)?;
        }
        if let Some(country) = &self.country {
            write!(f, ", C={}", country)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SanKind {
    Email,
    Uri,
    Dns,
}

/// Subject alternative names, each entry a template string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAlternativeNames {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
}

impl SubjectAlternativeNames {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.uris.is_empty() && self.dns_names.is_empty()
    }

    pub fn with_dns_name(mut self, name: impl Into<String>) -> Self {
        self.dns_names.push(name.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uris.push(uri.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.emails.push(email.into());
        self
    }

    /// Render every entry, dropping the ones that render empty
    pub fn render(&self, renderer: &dyn TemplateRenderer, context: &RenderContext) -> Self {
        let list = |entries: &[String]| {
            entries
                .iter()
                .map(|entry| renderer.render(entry, context))
                .filter(|entry| !entry.is_empty())
                .collect()
        };
        Self {
            emails: list(&self.emails),
            uris: list(&self.uris),
            dns_names: list(&self.dns_names),
        }
    }

    /// Order-independent view used for drift comparison
    pub fn as_set(&self) -> BTreeSet<(SanKind, &str)> {
        let emails = self.emails.iter().map(|e| (SanKind::Email, e.as_str()));
        let uris = self.uris.iter().map(|u| (SanKind::Uri, u.as_str()));
        let dns = self.dns_names.iter().map(|d| (SanKind::Dns, d.as_str()));
        emails.chain(uris).chain(dns).collect()
    }

    pub fn to_san_types(&self) -> Result<Vec<SanType>, EngineError> {
        let mut sans = Vec::new();
        for email in &self.emails {
            sans.push(SanType::Rfc822Name(email.clone().try_into()?));
        }
        for uri in &self.uris {
            sans.push(SanType::URI(uri.clone().try_into()?));
        }
        for dns in &self.dns_names {
            sans.push(SanType::DnsName(dns.clone().try_into()?));
        }
        Ok(sans)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateTemplate {
    #[serde(flatten)]
    pub envelope: DocumentEnvelope,

    pub display_name: String,

    /// Namespace of the issuing CA; equal to the template's own namespace for roots
    pub issuer_namespace_id: Uuid,
    pub issuer_template_id: DocumentId,

    pub key_properties: KeyProperties,
    pub subject: CertificateSubject,
    #[serde(default)]
    pub subject_alternative_names: SubjectAlternativeNames,
    pub usage: CertificateUsage,
    pub validity_in_months: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_trigger: Option<LifetimeTrigger>,

    /// Name of the key custody certificate object for chained issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_storage_path: Option<String>,
}

impl Document for CertificateTemplate {
    fn expected_kind() -> Option<DocumentKind> {
        Some(DocumentKind::CertificateTemplate)
    }

    fn envelope(&self) -> &DocumentEnvelope {
        &self.envelope
    }
}

impl CertificateTemplate {
    /// A self-issued template; use [`issued_by`](Self::issued_by) for chained ones
    pub fn new(
        namespace_id: Uuid,
        display_name: impl Into<String>,
        usage: CertificateUsage,
        subject: CertificateSubject,
        key_properties: KeyProperties,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), namespace_id, display_name, usage, subject, key_properties)
    }

    /// Like [`new`](Self::new) with a caller-chosen identifier
    pub fn with_id(
        id: Uuid,
        namespace_id: Uuid,
        display_name: impl Into<String>,
        usage: CertificateUsage,
        subject: CertificateSubject,
        key_properties: KeyProperties,
    ) -> Self {
        let id = DocumentId::new(DocumentKind::CertificateTemplate, id);
        Self {
            envelope: DocumentEnvelope::new(namespace_id, id),
            display_name: display_name.into(),
            issuer_namespace_id: namespace_id,
            issuer_template_id: id,
            key_properties,
            subject,
            subject_alternative_names: SubjectAlternativeNames::default(),
            usage,
            validity_in_months: 12,
            lifetime_trigger: None,
            key_storage_path: None,
        }
    }

    pub fn issued_by(mut self, issuer_namespace_id: Uuid, issuer_template_id: DocumentId) -> Self {
        self.issuer_namespace_id = issuer_namespace_id;
        self.issuer_template_id = issuer_template_id;
        self
    }

    pub fn with_validity_months(mut self, months: u32) -> Self {
        self.validity_in_months = months;
        self
    }

    pub fn with_lifetime_trigger(mut self, trigger: LifetimeTrigger) -> Self {
        self.lifetime_trigger = Some(trigger);
        self
    }

    pub fn with_subject_alternative_names(mut self, sans: SubjectAlternativeNames) -> Self {
        self.subject_alternative_names = sans;
        self
    }

    pub fn with_key_storage_path(mut self, path: impl Into<String>) -> Self {
        self.key_storage_path = Some(path.into());
        self
    }

    /// Root templates sign themselves
    pub fn is_self_issued(&self) -> bool {
        self.namespace_id() == self.issuer_namespace_id
    }

    pub fn is_deleted(&self) -> bool {
        self.envelope.is_deleted()
    }

    /// Template-write validation
    pub fn validate(
        &self,
        namespace_kind: NamespaceKind,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        if !self.usage.allowed_in(namespace_kind) {
            return Err(EngineError::Configuration(format!(
                "usage {} is not allowed in a {} namespace",
                self.usage, namespace_kind
            )));
        }
        if self.subject.common_name.trim().is_empty() {
            return Err(EngineError::Configuration(
                "subject common name is required".to_string(),
            ));
        }
        if self.validity_in_months == 0 {
            return Err(EngineError::Configuration(
                "validity must be at least one month".to_string(),
            ));
        }
        match self.lifetime_trigger {
            Some(LifetimeTrigger::DaysBeforeExpiry(0)) => {
                return Err(EngineError::Configuration(
                    "days before expiry must be positive".to_string(),
                ))
            }
            // A month is never shorter than 28 days
            Some(LifetimeTrigger::DaysBeforeExpiry(days))
                if u64::from(days) >= u64::from(self.validity_in_months) * 28 =>
            {
                return Err(EngineError::Configuration(format!(
                    "days before expiry ({}) must be shorter than the {} month validity",
                    days, self.validity_in_months
                )))
            }
            Some(LifetimeTrigger::LifetimePercentage(pct)) if !(1..=99).contains(&pct) => {
                return Err(EngineError::Configuration(format!(
                    "lifetime percentage {} is outside 1..=99",
                    pct
                )))
            }
            _ => {}
        }
        self.key_properties.validate(config)?;

        if self.usage == CertificateUsage::RootCa {
            if !self.is_self_issued() {
                return Err(EngineError::Configuration(
                    "a root CA must be issued from its own namespace".to_string(),
                ));
            }
        } else {
            if self.is_self_issued() {
                return Err(EngineError::Configuration(format!(
                    "{} certificates need an issuer in another namespace",
                    self.usage
                )));
            }
            if config.ca_namespace_kind(self.issuer_namespace_id).is_none() {
                return Err(EngineError::Configuration(format!(
                    "issuer namespace {} is not a CA namespace",
                    self.issuer_namespace_id
                )));
            }
            if self.issuer_template_id.kind() != DocumentKind::CertificateTemplate {
                return Err(EngineError::Configuration(format!(
                    "issuer {} is not a certificate template",
                    self.issuer_template_id
                )));
            }
        }

        if let Some(path) = &self.key_storage_path {
            certward_keys::validate_key_name(path)?;
        }

        Ok(())
    }
}
