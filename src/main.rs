//! Certward CLI - private CA issuance and renewal
//!
//! Registers the certificate templates declared in a YAML file and keeps
//! their certificates issued and renewed.

mod config;

use anyhow::{Context, Result};
use certward_engine::{
    ApplyOutcome, CertificateRecord, CertificateService, EngineError, Pipeline, SweepEntry,
};
use certward_keys::LocalKeyCustody;
use certward_store::{Document, DocumentId, DocumentKind, FsContentStore, FsDocumentStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{CertwardConfig, TemplateEntry, DEFAULT_CONFIG_FILE};

/// Certward - private certificate authority and renewal engine
#[derive(Parser, Debug)]
#[command(name = "certward")]
#[command(about = "Certward - private certificate authority and renewal engine")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "CERTWARD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Data directory (overrides storage.data_dir)
    #[arg(long, global = true, env = "CERTWARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Store the configured templates and issue what is missing or stale
    #[command(long_about = r#"
Store every template from the configuration file, then issue a certificate
for each template whose renewal decision says so. Templates are processed
root CAs first, then intermediates, then leaves.

EXAMPLES:
  # Issue everything that needs issuing
  certward apply

  # Reissue one template regardless of its current certificate
  certward apply --template api-mtls --force

ENVIRONMENT VARIABLES:
  CERTWARD_CONFIG    Configuration file (default: certward.yml)
  CERTWARD_DATA_DIR  Data directory for documents, blobs and keys
    "#)]
    Apply {
        /// Issue even when the current certificate is up to date
        #[arg(long)]
        force: bool,

        /// Only apply this template
        #[arg(long)]
        template: Option<String>,
    },

    /// Re-evaluate every stored template and renew what is due
    Sweep,

    /// Print renewal decisions without issuing
    Decide {
        /// Evaluate as if renewal were forced
        #[arg(long)]
        force: bool,
    },

    /// Show the latest certificate of a template
    Show {
        /// Template name from the configuration file
        template: String,

        /// Print the PEM chain only
        #[arg(long)]
        pem: bool,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Open the filesystem stores and key custody under `data_dir`
async fn open_service(config: &CertwardConfig, data_dir: &Path) -> Result<CertificateService> {
    info!("Using data directory {}", data_dir.display());

    let custody = LocalKeyCustody::open(data_dir.join("keys"))
        .await
        .context("Failed to open key custody")?;
    let pipeline = Pipeline::new(
        config.engine_config(),
        Arc::new(FsDocumentStore::new(data_dir.join("documents"))),
        Arc::new(FsContentStore::new(data_dir.join("content"))),
        Arc::new(custody),
    );

    if config.engine.allow_development_defaults {
        warn!("Development defaults enabled: CAs without an algorithm sign with RS384");
    }
    Ok(CertificateService::new(pipeline))
}

fn template_id(entry: &TemplateEntry) -> DocumentId {
    DocumentId::new(DocumentKind::CertificateTemplate, entry.id)
}

fn print_outcome(name: &str, outcome: &ApplyOutcome) {
    match &outcome.issued {
        Some(issued) => println!(
            "{:<24} issued   {} ({}), serial {}, expires {}",
            name,
            issued.record.id(),
            outcome.decision.reason,
            issued.record.serial_number,
            issued.record.not_after.to_rfc3339()
        ),
        None => println!("{:<24} current  ({})", name, outcome.decision.reason),
    }
}

fn print_record(record: &CertificateRecord) {
    println!("Certificate:  {}", record.certificate_id());
    println!("Template:     {}", record.template_id);
    println!("Subject:      {}", record.subject);
    if !record.subject_alternative_names.is_empty() {
        for name in &record.subject_alternative_names.dns_names {
            println!("  DNS:        {}", name);
        }
        for uri in &record.subject_alternative_names.uris {
            println!("  URI:        {}", uri);
        }
        for email in &record.subject_alternative_names.emails {
            println!("  Email:      {}", email);
        }
    }
    println!("Usage:        {}", record.usage);
    println!("Serial:       {}", record.serial_number);
    println!("Not before:   {}", record.not_before.to_rfc3339());
    println!("Not after:    {}", record.not_after.to_rfc3339());
    println!("Signed with:  {}", record.key.signature_algorithm);
    println!("SHA-1:        {}", record.key.thumbprint_sha1);
    println!("SHA-256:      {}", record.key.thumbprint_sha256);
    println!("Issuer:       {}", record.issuer_certificate_id);
    if let Some(previous) = &record.supersedes {
        println!("Supersedes:   {}", previous);
    }
}

/// Retry the alias write once when issuance left it pending
async fn repair_pending_alias(service: &CertificateService, err: &EngineError) {
    let Some(record) = err.pending_record() else {
        return;
    };
    warn!(
        "Certificate {} stored but alias is pending, retrying publication",
        record.id()
    );
    match service.pipeline().publish_alias(record).await {
        Ok(_) => info!("Alias for certificate {} published", record.id()),
        Err(e) => error!("Alias for certificate {} still pending: {}", record.id(), e),
    }
}

async fn apply(
    config: &CertwardConfig,
    service: &CertificateService,
    force: bool,
    only: Option<&str>,
) -> Result<()> {
    if let Some(name) = only {
        config
            .template(name)
            .with_context(|| format!("No template named '{}' in configuration", name))?;
    }

    let templates = config.templates_in_issuance_order();
    for entry in &templates {
        let namespace = config
            .namespace(&entry.namespace)
            .with_context(|| format!("Unknown namespace '{}'", entry.namespace))?;
        service
            .put_template(namespace.kind, config.to_template(entry)?)
            .await
            .with_context(|| format!("Failed to store template '{}'", entry.name))?;
    }

    let mut failures = 0;
    for entry in templates
        .iter()
        .filter(|entry| only.map_or(true, |name| entry.name == name))
    {
        let namespace = config
            .namespace(&entry.namespace)
            .with_context(|| format!("Unknown namespace '{}'", entry.namespace))?;
        let context = config.context_for(namespace);

        match service
            .apply(namespace.kind, namespace.id, &template_id(entry), &context, force)
            .await
        {
            Ok(outcome) => print_outcome(&entry.name, &outcome),
            Err(e) => {
                failures += 1;
                error!("Failed to apply template '{}': {}", entry.name, e);
                repair_pending_alias(service, &e).await;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} template(s) failed", failures);
    }
    Ok(())
}

async fn sweep(config: &CertwardConfig, service: &CertificateService) -> Result<()> {
    let mut failures = 0;
    for namespace in config.namespaces_in_issuance_order() {
        let context = config.context_for(namespace);
        let entries: Vec<SweepEntry> = service
            .sweep(namespace.kind, namespace.id, &context)
            .await
            .with_context(|| format!("Failed to sweep namespace '{}'", namespace.name))?;

        for entry in entries {
            let name = config
                .templates
                .iter()
                .find(|t| t.id == entry.template_id.value())
                .map(|t| t.name.clone())
                .unwrap_or_else(|| entry.template_id.to_string());
            match entry.result {
                Ok(outcome) => print_outcome(&name, &outcome),
                Err(e) => {
                    failures += 1;
                    println!("{:<24} failed   {}", name, e);
                    repair_pending_alias(service, &e).await;
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} template(s) failed", failures);
    }
    Ok(())
}

async fn decide(config: &CertwardConfig, service: &CertificateService, force: bool) -> Result<()> {
    let now = Utc::now();
    for entry in config.templates_in_issuance_order() {
        let namespace = config
            .namespace(&entry.namespace)
            .with_context(|| format!("Unknown namespace '{}'", entry.namespace))?;

        match service
            .evaluate(namespace.id, &template_id(entry), now, force)
            .await
        {
            Ok(decision) => println!(
                "{:<24} {:<6} {}",
                entry.name,
                if decision.should_issue { "issue" } else { "keep" },
                decision.reason
            ),
            Err(e) if e.is_not_found() => {
                println!("{:<24} {:<6} template not stored yet", entry.name, "-")
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to evaluate '{}'", entry.name)),
        }
    }
    Ok(())
}

async fn show(
    config: &CertwardConfig,
    service: &CertificateService,
    name: &str,
    pem_only: bool,
) -> Result<()> {
    let entry = config
        .template(name)
        .with_context(|| format!("No template named '{}' in configuration", name))?;
    let namespace = config
        .namespace(&entry.namespace)
        .with_context(|| format!("Unknown namespace '{}'", entry.namespace))?;

    let Some(latest) = service
        .latest(namespace.id, &template_id(entry))
        .await
        .with_context(|| format!("Failed to read latest certificate of '{}'", name))?
    else {
        anyhow::bail!("No certificate issued for '{}' yet", name);
    };

    let chain = service
        .pem_chain(&latest)
        .await
        .context("Failed to read certificate chain")?;

    if pem_only {
        print!("{}", chain);
    } else {
        print_record(&latest);
        println!();
        print!("{}", chain);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    if let Commands::Init { force } = cli.command {
        if cli.config.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                cli.config.display()
            );
        }
        std::fs::write(&cli.config, CertwardConfig::template_file())
            .with_context(|| format!("Failed to write config file: {:?}", cli.config))?;
        info!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = CertwardConfig::load(&cli.config)?;
    let data_dir = config.data_dir(cli.data_dir.as_deref());
    let service = open_service(&config, &data_dir).await?;

    match cli.command {
        Commands::Apply { force, template } => {
            apply(&config, &service, force, template.as_deref()).await
        }
        Commands::Sweep => sweep(&config, &service).await,
        Commands::Decide { force } => decide(&config, &service, force).await,
        Commands::Show { template, pem } => show(&config, &service, &template, pem).await,
        Commands::Init { .. } => Ok(()),
    }
}
