//! Renewal decision
//!
//! Compares a template against the certificate currently published for it
//! and decides whether a new one must be issued. Rules are evaluated in a
//! fixed order and the first match wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::record::CertificateRecord;
use crate::template::{CertificateTemplate, LifetimeTrigger};

/// What is known about the current certificate for a template
#[derive(Debug, Clone, Copy)]
pub enum PriorState<'a> {
    /// No certificate was ever published
    Missing,
    /// Reading the published certificate failed
    Unreadable(&'a str),
    Record(&'a CertificateRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenewalReason {
    Forced,
    PriorStateUnreadable,
    NoActiveCertificate,
    TemplateMismatch,
    IssuerNamespaceMismatch,
    SubjectMismatch,
    KeyMismatch,
    SanMismatch,
    UsageMismatch,
    WithinDaysBeforeExpiry,
    PastLifetimePercentage,
    UpToDate,
}

impl RenewalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RenewalReason::Forced => "forced",
            RenewalReason::PriorStateUnreadable => "error reading prior state",
            RenewalReason::NoActiveCertificate => "no active certificate",
            RenewalReason::TemplateMismatch => "template mismatch",
            RenewalReason::IssuerNamespaceMismatch => "issuer namespace mismatch",
            RenewalReason::SubjectMismatch => "subject mismatch",
            RenewalReason::KeyMismatch => "key mismatch",
            RenewalReason::SanMismatch => "SAN mismatch",
            RenewalReason::UsageMismatch => "usage mismatch",
            RenewalReason::WithinDaysBeforeExpiry => "within days before expiry window",
            RenewalReason::PastLifetimePercentage => "past lifetime percentage threshold",
            RenewalReason::UpToDate => "up to date",
        }
    }
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenewalDecision {
    pub should_issue: bool,
    pub reason: RenewalReason,
}

impl RenewalDecision {
    fn issue(reason: RenewalReason) -> Self {
        Self {
            should_issue: true,
            reason,
        }
    }

    fn keep() -> Self {
        Self {
            should_issue: false,
            reason: RenewalReason::UpToDate,
        }
    }
}

/// Decide whether `template` needs a new certificate at `now`
pub fn decide(
    template: &CertificateTemplate,
    current: PriorState<'_>,
    now: DateTime<Utc>,
    force: bool,
) -> RenewalDecision {
    if force {
        return RenewalDecision::issue(RenewalReason::Forced);
    }

    let record = match current {
        PriorState::Unreadable(_) => {
            return RenewalDecision::issue(RenewalReason::PriorStateUnreadable)
        }
        PriorState::Missing => return RenewalDecision::issue(RenewalReason::NoActiveCertificate),
        PriorState::Record(record) if !record.is_active_at(now) => {
            return RenewalDecision::issue(RenewalReason::NoActiveCertificate)
        }
        PriorState::Record(record) => record,
    };

    if template.envelope.id != record.template_id {
        return RenewalDecision::issue(RenewalReason::TemplateMismatch);
    }
    if template.issuer_namespace_id != record.issuer_namespace_id {
        return RenewalDecision::issue(RenewalReason::IssuerNamespaceMismatch);
    }
    if template.subject.to_string() != record.subject_base {
        return RenewalDecision::issue(RenewalReason::SubjectMismatch);
    }
    if let (Some(wanted), Some(issued)) = (template.key_properties.algorithm, record.key.algorithm)
    {
        if wanted != issued || template.key_properties.key != record.key.key {
            return RenewalDecision::issue(RenewalReason::KeyMismatch);
        }
    }
    if template.subject_alternative_names.as_set() != record.subject_alternative_names_base.as_set()
    {
        return RenewalDecision::issue(RenewalReason::SanMismatch);
    }
    if template.usage != record.usage {
        return RenewalDecision::issue(RenewalReason::UsageMismatch);
    }

    let Some(trigger) = template.lifetime_trigger else {
        return RenewalDecision::keep();
    };
    // An unrepresentable threshold lies beyond any instant `now` can reach
    match trigger.threshold(record.not_before, record.not_after) {
        Some(due_at) if now >= due_at => RenewalDecision::issue(match trigger {
            LifetimeTrigger::DaysBeforeExpiry(_) => RenewalReason::WithinDaysBeforeExpiry,
            LifetimeTrigger::LifetimePercentage(_) => RenewalReason::PastLifetimePercentage,
        }),
        _ => RenewalDecision::keep(),
    }
}
