//! Certificate issuance and renewal engine
//!
//! Turns certificate templates into signed certificates whose issuer keys
//! stay in key custody, decides when an issued certificate needs renewing,
//! and keeps exactly one discoverable "latest" certificate per template.

pub mod chain;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod render;
pub mod renewal;
pub mod service;
pub mod signer;
pub mod template;
pub mod x509;

pub use config::{EngineConfig, NamespaceKind};
pub use error::EngineError;
pub use pipeline::{Issued, Pipeline};
pub use record::{CertificateKeyMetadata, CertificateRecord};
pub use render::{RenderContext, TemplateRenderer, VariableRenderer};
pub use renewal::{decide, PriorState, RenewalDecision, RenewalReason};
pub use service::{ApplyOutcome, CertificateService, SweepEntry};
pub use signer::{CustodySigningKey, ResolvedSigner, SignerKind, SignerResolver};
pub use template::{
    CertificateSubject, CertificateTemplate, CertificateUsage, KeyProperties, LifetimeTrigger,
    SubjectAlternativeNames,
};
pub use x509::{CertificateSummary, UsageProfile};
