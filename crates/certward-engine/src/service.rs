//! Template registration, apply and renewal sweep
//!
//! Wraps the pipeline with the read-decide-issue loop. Calls for the same
//! `(namespace, template)` are serialized so two callers cannot both decide
//! to issue from the same stale alias.

use certward_store::{Document, DocumentId, DocumentKind, DocumentStore, DocumentStoreExt};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::NamespaceKind;
use crate::error::EngineError;
use crate::pipeline::{Issued, Pipeline};
use crate::record::CertificateRecord;
use crate::render::RenderContext;
use crate::renewal::{decide, PriorState, RenewalDecision};
use crate::template::CertificateTemplate;

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub template_id: DocumentId,
    pub decision: RenewalDecision,
    /// Present when the decision led to an issuance
    pub issued: Option<Issued>,
}

/// One template's result within a sweep
#[derive(Debug)]
pub struct SweepEntry {
    pub template_id: DocumentId,
    pub result: Result<ApplyOutcome, EngineError>,
}

type LockKey = (Uuid, DocumentId);

#[derive(Clone)]
pub struct CertificateService {
    pipeline: Pipeline,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl CertificateService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn documents(&self) -> &Arc<dyn DocumentStore> {
        self.pipeline.documents()
    }

    /// Validate and store a template
    pub async fn put_template(
        &self,
        namespace_kind: NamespaceKind,
        mut template: CertificateTemplate,
    ) -> Result<CertificateTemplate, EngineError> {
        template.validate(namespace_kind, self.pipeline.config())?;
        template.envelope.touch(Utc::now());
        self.documents().write(&template).await?;

        info!(
            "Stored template {} '{}' ({})",
            template.id(),
            template.display_name,
            template.usage
        );
        Ok(template)
    }

    pub async fn template(
        &self,
        namespace_id: Uuid,
        template_id: &DocumentId,
    ) -> Result<CertificateTemplate, EngineError> {
        Ok(self.documents().read(namespace_id, template_id).await?)
    }

    /// Soft-delete a template; its certificates stay readable
    pub async fn delete_template(
        &self,
        namespace_id: Uuid,
        template_id: &DocumentId,
    ) -> Result<CertificateTemplate, EngineError> {
        let mut template = self.template(namespace_id, template_id).await?;
        template.envelope.soft_delete(Utc::now());
        self.documents().write(&template).await?;
        info!("Deleted template {}", template_id);
        Ok(template)
    }

    /// Latest alias for a template, `None` when nothing was issued yet
    pub async fn latest(
        &self,
        namespace_id: Uuid,
        template_id: &DocumentId,
    ) -> Result<Option<CertificateRecord>, EngineError> {
        let alias_id = CertificateRecord::latest_alias_id(template_id);
        match self.documents().read(namespace_id, &alias_id).await {
            Ok(alias) => Ok(Some(alias)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn certificate(
        &self,
        namespace_id: Uuid,
        certificate_id: &DocumentId,
    ) -> Result<CertificateRecord, EngineError> {
        if certificate_id.kind() != DocumentKind::Certificate {
            return Err(EngineError::Configuration(format!(
                "{} is not a certificate id",
                certificate_id
            )));
        }
        Ok(self.documents().read(namespace_id, certificate_id).await?)
    }

    /// PEM chain stored for a record
    pub async fn pem_chain(&self, record: &CertificateRecord) -> Result<String, EngineError> {
        let blob = self.pipeline.content().get(&record.blob_path).await?;
        String::from_utf8(blob).map_err(|e| EngineError::Codec(format!("chain is not PEM: {}", e)))
    }

    async fn prior(&self, template: &CertificateTemplate) -> Result<Option<CertificateRecord>, String> {
        self.latest(template.namespace_id(), &template.id())
            .await
            .map_err(|e| e.to_string())
    }

    /// Renewal decision for a stored template at `now`, without issuing
    pub async fn evaluate(
        &self,
        namespace_id: Uuid,
        template_id: &DocumentId,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<RenewalDecision, EngineError> {
        let template = self.template(namespace_id, template_id).await?;
        let prior = self.prior(&template).await;
        Ok(decide_against(&template, &prior, now, force))
    }

    /// Number of templates with an apply in flight
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Decide for a stored template and issue when needed
    pub async fn apply(
        &self,
        namespace_kind: NamespaceKind,
        namespace_id: Uuid,
        template_id: &DocumentId,
        context: &RenderContext,
        force: bool,
    ) -> Result<ApplyOutcome, EngineError> {
        let key = (namespace_id, *template_id);
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.apply_locked(namespace_kind, namespace_id, template_id, context, force)
                .await
        };

        // The map holds the last reference once no caller waits on the lock
        drop(lock);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    async fn apply_locked(
        &self,
        namespace_kind: NamespaceKind,
        namespace_id: Uuid,
        template_id: &DocumentId,
        context: &RenderContext,
        force: bool,
    ) -> Result<ApplyOutcome, EngineError> {
        let template = self.template(namespace_id, template_id).await?;
        if template.is_deleted() {
            return Err(EngineError::Configuration(format!(
                "template {} is deleted",
                template_id
            )));
        }

        let prior = self.prior(&template).await;
        let decision = decide_against(&template, &prior, Utc::now(), force);
        debug!("Template {}: {}", template_id, decision.reason);

        if !decision.should_issue {
            return Ok(ApplyOutcome {
                template_id: *template_id,
                decision,
                issued: None,
            });
        }

        let existing = prior.ok().flatten().map(|record| record.certificate_id());
        let issued = self
            .pipeline
            .issue(namespace_kind, namespace_id, &template, context, existing)
            .await?;

        Ok(ApplyOutcome {
            template_id: *template_id,
            decision,
            issued: Some(issued),
        })
    }

    /// Apply every active template of a namespace in turn
    ///
    /// A failing template does not stop the sweep; its error is reported in
    /// its entry.
    pub async fn sweep(
        &self,
        namespace_kind: NamespaceKind,
        namespace_id: Uuid,
        context: &RenderContext,
    ) -> Result<Vec<SweepEntry>, EngineError> {
        let templates: Vec<CertificateTemplate> = self
            .documents()
            .read_all(namespace_id, DocumentKind::CertificateTemplate)
            .await?;

        let mut entries = Vec::with_capacity(templates.len());
        for template in templates.iter().filter(|t| !t.is_deleted()) {
            let template_id = template.id();
            let result = self
                .apply(namespace_kind, namespace_id, &template_id, context, false)
                .await;
            if let Err(e) = &result {
                error!("Renewal of template {} failed: {}", template_id, e);
            }
            entries.push(SweepEntry {
                template_id,
                result,
            });
        }

        let issued = entries
            .iter()
            .filter(|entry| matches!(&entry.result, Ok(outcome) if outcome.issued.is_some()))
            .count();
        info!(
            "Swept {} templates in namespace {}, {} issued",
            entries.len(),
            namespace_id,
            issued
        );
        Ok(entries)
    }
}

fn decide_against(
    template: &CertificateTemplate,
    prior: &Result<Option<CertificateRecord>, String>,
    now: DateTime<Utc>,
    force: bool,
) -> RenewalDecision {
    let state = match prior {
        Ok(Some(record)) => PriorState::Record(record),
        Ok(None) => PriorState::Missing,
        Err(reason) => PriorState::Unreadable(reason),
    };
    decide(template, state, now, force)
}
