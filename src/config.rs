//! CLI configuration file support
//!
//! A single YAML file declares the namespaces the engine works in and the
//! certificate templates living in them. Templates reference their issuer by
//! name; the file is validated as a whole before anything is stored.

use anyhow::{Context, Result};
use certward_engine::{
    CertificateSubject, CertificateTemplate, CertificateUsage, EngineConfig, KeyProperties,
    LifetimeTrigger, NamespaceKind, RenderContext, SubjectAlternativeNames,
};
use certward_store::{DocumentId, DocumentKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "certward.yml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertwardConfig {
    /// Engine settings; CA namespace lists are completed from `namespaces`
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,

    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for documents, blobs and keys (supports ${ENV_VAR} expansion)
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceEntry {
    /// Short name used by templates to refer to this namespace
    pub name: String,
    pub id: Uuid,
    pub kind: NamespaceKind,

    /// Binding variables for subject rendering (values support ${ENV_VAR} expansion)
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEntry {
    /// Stable template identifier
    pub id: Uuid,

    /// Unique name, used for issuer references and `show`
    pub name: String,

    /// Name of the namespace the template lives in
    pub namespace: String,

    pub usage: CertificateUsage,

    /// Name of the issuing template; absent for root CAs
    #[serde(default)]
    pub issuer: Option<String>,

    pub subject: CertificateSubject,

    #[serde(default)]
    pub subject_alternative_names: SubjectAlternativeNames,

    pub key_properties: KeyProperties,

    #[serde(default = "default_validity")]
    pub validity_in_months: u32,

    #[serde(default)]
    pub lifetime_trigger: Option<LifetimeTriggerEntry>,

    #[serde(default)]
    pub key_storage_path: Option<String>,
}

fn default_validity() -> u32 {
    12
}

/// Renewal trigger as written in YAML; exactly one field must be set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LifetimeTriggerEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_before_expiry: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_percentage: Option<u8>,
}

impl LifetimeTriggerEntry {
    pub fn trigger(&self) -> Result<LifetimeTrigger> {
        match (self.days_before_expiry, self.lifetime_percentage) {
            (Some(days), None) => Ok(LifetimeTrigger::DaysBeforeExpiry(days)),
            (None, Some(pct)) => Ok(LifetimeTrigger::LifetimePercentage(pct)),
            _ => anyhow::bail!(
                "lifetime_trigger needs exactly one of days_before_expiry or lifetime_percentage"
            ),
        }
    }
}

impl CertwardConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: CertwardConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for namespace in &self.namespaces {
            if !names.insert(namespace.name.as_str()) {
                anyhow::bail!("Duplicate namespace name: {}", namespace.name);
            }
            if !ids.insert(namespace.id) {
                anyhow::bail!("Duplicate namespace id: {}", namespace.id);
            }
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for template in &self.templates {
            if !names.insert(template.name.as_str()) {
                anyhow::bail!("Duplicate template name: {}", template.name);
            }
            if !ids.insert(template.id) {
                anyhow::bail!("Duplicate template id: {}", template.id);
            }
        }

        for template in &self.templates {
            if let Some(trigger) = &template.lifetime_trigger {
                trigger
                    .trigger()
                    .with_context(|| format!("Template '{}'", template.name))?;
            }
            let namespace = self.namespace(&template.namespace).with_context(|| {
                format!(
                    "Template '{}' refers to unknown namespace '{}'",
                    template.name, template.namespace
                )
            })?;
            if !template.usage.allowed_in(namespace.kind) {
                anyhow::bail!(
                    "Template '{}': usage {} is not allowed in {} namespace '{}'",
                    template.name,
                    template.usage,
                    namespace.kind,
                    namespace.name
                );
            }

            match (&template.issuer, template.usage) {
                (Some(_), CertificateUsage::RootCa) => anyhow::bail!(
                    "Template '{}': a root CA cannot name an issuer",
                    template.name
                ),
                (None, usage) if usage != CertificateUsage::RootCa => anyhow::bail!(
                    "Template '{}': an issuer is required for usage {}",
                    template.name,
                    usage
                ),
                (Some(issuer), _) => {
                    let issuer = self.template(issuer).with_context(|| {
                        format!(
                            "Template '{}' refers to unknown issuer '{}'",
                            template.name, issuer
                        )
                    })?;
                    if !issuer.usage.is_ca() {
                        anyhow::bail!(
                            "Template '{}': issuer '{}' is not a CA template",
                            template.name,
                            issuer.name
                        );
                    }
                }
                (None, _) => {}
            }
        }

        Ok(())
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceEntry> {
        self.namespaces.iter().find(|n| n.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&TemplateEntry> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Engine configuration with every CA namespace of the file registered
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = self.engine.clone();
        for namespace in &self.namespaces {
            match namespace.kind {
                NamespaceKind::RootCa if !engine.root_ca_namespaces.contains(&namespace.id) => {
                    engine.root_ca_namespaces.push(namespace.id);
                }
                NamespaceKind::IntermediateCa
                    if !engine.intermediate_ca_namespaces.contains(&namespace.id) =>
                {
                    engine.intermediate_ca_namespaces.push(namespace.id);
                }
                _ => {}
            }
        }
        engine
    }

    /// Data directory: CLI override first, then the file, then `.certward`
    pub fn data_dir(&self, cli_override: Option<&Path>) -> PathBuf {
        if let Some(dir) = cli_override {
            return dir.to_path_buf();
        }
        self.storage
            .data_dir
            .as_deref()
            .map(expand_env_vars)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".certward"))
    }

    /// Render context for templates in `namespace`
    pub fn context_for(&self, namespace: &NamespaceEntry) -> RenderContext {
        let mut context: RenderContext = namespace
            .variables
            .iter()
            .map(|(name, value)| (name.clone(), expand_env_vars(value)))
            .collect();
        context.set(
            certward_engine::render::vars::NAMESPACE_ID,
            namespace.id.to_string(),
        );
        context
    }

    /// Namespaces ordered so issuers come before what they issue
    pub fn namespaces_in_issuance_order(&self) -> Vec<&NamespaceEntry> {
        let mut namespaces: Vec<&NamespaceEntry> = self.namespaces.iter().collect();
        namespaces.sort_by_key(|n| issuance_rank(n.kind));
        namespaces
    }

    /// Templates ordered so issuers come before what they issue
    pub fn templates_in_issuance_order(&self) -> Vec<&TemplateEntry> {
        let mut templates: Vec<&TemplateEntry> = self.templates.iter().collect();
        templates.sort_by_key(|t| match t.usage {
            CertificateUsage::RootCa => 0,
            CertificateUsage::IntermediateCa => 1,
            _ => 2,
        });
        templates
    }

    /// Build the engine template for an entry
    pub fn to_template(&self, entry: &TemplateEntry) -> Result<CertificateTemplate> {
        let namespace = self
            .namespace(&entry.namespace)
            .with_context(|| format!("Unknown namespace '{}'", entry.namespace))?;

        let mut template = CertificateTemplate::with_id(
            entry.id,
            namespace.id,
            entry.name.clone(),
            entry.usage,
            entry.subject.clone(),
            entry.key_properties,
        )
        .with_validity_months(entry.validity_in_months)
        .with_subject_alternative_names(entry.subject_alternative_names.clone());

        if let Some(issuer_name) = &entry.issuer {
            let issuer = self
                .template(issuer_name)
                .with_context(|| format!("Unknown issuer '{}'", issuer_name))?;
            let issuer_namespace = self
                .namespace(&issuer.namespace)
                .with_context(|| format!("Unknown namespace '{}'", issuer.namespace))?;
            template = template.issued_by(
                issuer_namespace.id,
                DocumentId::new(DocumentKind::CertificateTemplate, issuer.id),
            );
        }
        if let Some(trigger) = &entry.lifetime_trigger {
            template = template.with_lifetime_trigger(trigger.trigger()?);
        }
        if let Some(path) = &entry.key_storage_path {
            template = template.with_key_storage_path(path.clone());
        }

        Ok(template)
    }

    /// Generate a template config file content
    pub fn template_file() -> String {
        format!(
            r#"# Certward configuration

engine:
  allow_development_defaults: false

storage:
  data_dir: ".certward"

namespaces:
  - name: root
    id: {root_ns}
    kind: root-ca
  - name: intermediate
    id: {intermediate_ns}
    kind: intermediate-ca
  - name: api
    id: {service_ns}
    kind: service-principal
    variables:
      request.fqdn: "api.internal.example"
      service_principal.uri: "urn:example:sp:api"

templates:
  - name: root-ca
    id: {root}
    namespace: root
    usage: root-ca
    subject:
      common_name: "Example Root CA"
      organization: "Example"
    key_properties:
      algorithm: ES384
      key: {{ kty: EC, curve: P-384 }}
    validity_in_months: 120
    lifetime_trigger:
      lifetime_percentage: 80

  - name: intermediate-ca
    id: {intermediate}
    namespace: intermediate
    usage: intermediate-ca
    issuer: root-ca
    subject:
      common_name: "Example Intermediate CA"
      organization: "Example"
    key_properties:
      algorithm: ES256
      key: {{ kty: EC, curve: P-256 }}
    validity_in_months: 60
    key_storage_path: intermediate-ca

  - name: api-mtls
    id: {leaf}
    namespace: api
    usage: server-and-client
    issuer: intermediate-ca
    subject:
      common_name: "${{request.fqdn}}"
    subject_alternative_names:
      dns_names: ["${{request.fqdn}}"]
      uris: ["${{service_principal.uri}}"]
    key_properties:
      algorithm: ES256
      key: {{ kty: EC, curve: P-256 }}
    validity_in_months: 3
    lifetime_trigger:
      days_before_expiry: 30
    key_storage_path: api-mtls
"#,
            root_ns = Uuid::new_v4(),
            intermediate_ns = Uuid::new_v4(),
            service_ns = Uuid::new_v4(),
            root = Uuid::new_v4(),
            intermediate = Uuid::new_v4(),
            leaf = Uuid::new_v4(),
        )
    }
}

fn issuance_rank(kind: NamespaceKind) -> u8 {
    match kind {
        NamespaceKind::RootCa => 0,
        NamespaceKind::IntermediateCa => 1,
        _ => 2,
    }
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. If the variable is not set, returns empty string.
/// Only applied to storage paths and namespace variable values, never to
/// template strings, which use the same syntax for binding variables.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return result;
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use certward_store::Document;
    use certward_keys::{EllipticCurve, KeySpec, SignatureAlgorithm};

    const ROOT_NS: &str = "4f1c2a9e-8d5b-4c1e-9a3f-0b6d7e8f9a01";
    const INT_NS: &str = "5a2d3b0f-9e6c-4d2f-8b4a-1c7e8f9a0b12";
    const SVC_NS: &str = "6b3e4c1a-0f7d-4e3a-9c5b-2d8f9a0b1c23";

    fn hierarchy_yaml() -> String {
        format!(
            r#"
namespaces:
  - name: root
    id: {ROOT_NS}
    kind: root-ca
  - name: intermediate
    id: {INT_NS}
    kind: intermediate-ca
  - name: api
    id: {SVC_NS}
    kind: service-principal
    variables:
      request.fqdn: api.example.test

templates:
  - name: api
    id: 7c4f5d2b-1a8e-4f4b-8d6c-3e9a0b1c2d34
    namespace: api
    usage: server-only
    issuer: intermediate-ca
    subject:
      common_name: "${{request.fqdn}}"
    subject_alternative_names:
      dns_names: ["${{request.fqdn}}"]
    key_properties:
      algorithm: ES256
      key: {{ kty: EC, curve: P-256 }}
    lifetime_trigger:
      days_before_expiry: 30
    key_storage_path: api
  - name: intermediate-ca
    id: 8d5a6e3c-2b9f-4a5c-9e7d-4f0b1c2d3e45
    namespace: intermediate
    usage: intermediate-ca
    issuer: root-ca
    subject:
      common_name: Test Intermediate
    key_properties:
      algorithm: ES256
      key: {{ kty: EC, curve: P-256 }}
    key_storage_path: intermediate-ca
  - name: root-ca
    id: 9e6b7f4d-3c0a-4b6d-8f8e-5a1c2d3e4f56
    namespace: root
    usage: root-ca
    subject:
      common_name: Test Root
      organization: Certward
    key_properties:
      algorithm: ES384
      key: {{ kty: EC, curve: P-384 }}
    validity_in_months: 120
"#
        )
    }

    #[test]
    fn test_parse_hierarchy() {
        let config = CertwardConfig::parse(&hierarchy_yaml()).unwrap();
        assert_eq!(config.namespaces.len(), 3);
        assert_eq!(config.templates.len(), 3);

        let root = config.template("root-ca").unwrap();
        assert_eq!(root.validity_in_months, 120);
        assert_eq!(
            root.key_properties.key,
            KeySpec::Ec {
                curve: EllipticCurve::P384
            }
        );
        assert_eq!(root.key_properties.algorithm, Some(SignatureAlgorithm::ES384));

        let api = config.template("api").unwrap();
        assert_eq!(api.validity_in_months, 12); // default
        let trigger = api.lifetime_trigger.unwrap().trigger().unwrap();
        assert_eq!(trigger, LifetimeTrigger::DaysBeforeExpiry(30));

        let root = config.to_template(config.template("root-ca").unwrap()).unwrap();
        assert_eq!(root.lifetime_trigger, None);
    }

    #[test]
    fn test_engine_config_registers_ca_namespaces() {
        let config = CertwardConfig::parse(&hierarchy_yaml()).unwrap();
        let engine = config.engine_config();

        assert_eq!(engine.root_ca_namespaces, vec![ROOT_NS.parse::<Uuid>().unwrap()]);
        assert_eq!(
            engine.intermediate_ca_namespaces,
            vec![INT_NS.parse::<Uuid>().unwrap()]
        );
        assert!(!engine.allow_development_defaults);
    }

    #[test]
    fn test_issuance_order() {
        let config = CertwardConfig::parse(&hierarchy_yaml()).unwrap();
        let names: Vec<&str> = config
            .templates_in_issuance_order()
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["root-ca", "intermediate-ca", "api"]);

        let kinds: Vec<NamespaceKind> = config
            .namespaces_in_issuance_order()
            .iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NamespaceKind::RootCa,
                NamespaceKind::IntermediateCa,
                NamespaceKind::ServicePrincipal
            ]
        );
    }

    #[test]
    fn test_to_template_resolves_issuer() {
        let config = CertwardConfig::parse(&hierarchy_yaml()).unwrap();
        let api = config.to_template(config.template("api").unwrap()).unwrap();
        let engine = config.engine_config();

        assert_eq!(api.namespace_id(), SVC_NS.parse::<Uuid>().unwrap());
        assert_eq!(api.issuer_namespace_id, INT_NS.parse::<Uuid>().unwrap());
        assert_eq!(
            api.issuer_template_id.value(),
            config.template("intermediate-ca").unwrap().id
        );
        assert_eq!(api.key_storage_path.as_deref(), Some("api"));
        api.validate(NamespaceKind::ServicePrincipal, &engine).unwrap();

        let root = config.to_template(config.template("root-ca").unwrap()).unwrap();
        assert!(root.is_self_issued());
        root.validate(NamespaceKind::RootCa, &engine).unwrap();
    }

    #[test]
    fn test_template_strings_are_not_env_expanded() {
        std::env::set_var("request.fqdn", "from-env");
        let config = CertwardConfig::parse(&hierarchy_yaml()).unwrap();
        let api = config.template("api").unwrap();
        assert_eq!(api.subject.common_name, "${request.fqdn}");
        std::env::remove_var("request.fqdn");
    }

    #[test]
    fn test_context_for_namespace() {
        std::env::set_var("CERTWARD_TEST_FQDN", "svc.example.test");
        let yaml = format!(
            r#"
namespaces:
  - name: api
    id: {SVC_NS}
    kind: service-principal
    variables:
      request.fqdn: "${{CERTWARD_TEST_FQDN}}"
"#
        );
        let config = CertwardConfig::parse(&yaml).unwrap();
        let context = config.context_for(config.namespace("api").unwrap());

        assert_eq!(context.get("request.fqdn"), Some("svc.example.test"));
        assert_eq!(context.get("namespace.id"), Some(SVC_NS));
        std::env::remove_var("CERTWARD_TEST_FQDN");
    }

    #[test]
    fn test_unknown_issuer() {
        let yaml = hierarchy_yaml().replace("issuer: root-ca", "issuer: missing-ca");
        let result = CertwardConfig::parse(&yaml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown issuer 'missing-ca'"));
    }

    #[test]
    fn test_leaf_issuer_must_be_ca() {
        let yaml = hierarchy_yaml().replace("issuer: intermediate-ca", "issuer: api");
        let result = CertwardConfig::parse(&yaml);
        assert!(result.unwrap_err().to_string().contains("is not a CA template"));
    }

    #[test]
    fn test_root_cannot_name_issuer() {
        let yaml = hierarchy_yaml().replace(
            "    usage: root-ca\n",
            "    usage: root-ca\n    issuer: intermediate-ca\n",
        );
        let result = CertwardConfig::parse(&yaml);
        assert!(result.unwrap_err().to_string().contains("cannot name an issuer"));
    }

    #[test]
    fn test_usage_not_allowed_in_namespace() {
        let yaml = hierarchy_yaml().replace("usage: server-only", "usage: intermediate-ca");
        let result = CertwardConfig::parse(&yaml);
        assert!(result.unwrap_err().to_string().contains("is not allowed"));
    }

    #[test]
    fn test_duplicate_template_names() {
        let yaml = hierarchy_yaml().replace(
            "- name: api\n    id: 7c4f",
            "- name: root-ca\n    id: 7c4f",
        );
        let result = CertwardConfig::parse(&yaml);
        assert!(result.unwrap_err().to_string().contains("Duplicate template name"));
    }

    #[test]
    fn test_data_dir_resolution() {
        let config = CertwardConfig::default();
        assert_eq!(config.data_dir(None), PathBuf::from(".certward"));
        assert_eq!(
            config.data_dir(Some(Path::new("/var/lib/certward"))),
            PathBuf::from("/var/lib/certward")
        );

        std::env::set_var("CERTWARD_TEST_HOME", "/srv/pki");
        let config = CertwardConfig::parse("storage:\n  data_dir: \"${CERTWARD_TEST_HOME}/data\"\n")
            .unwrap();
        assert_eq!(config.data_dir(None), PathBuf::from("/srv/pki/data"));
        std::env::remove_var("CERTWARD_TEST_HOME");
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("CERTWARD_TEST_VAR", "value");
        assert_eq!(expand_env_vars("${CERTWARD_TEST_VAR}"), "value");
        assert_eq!(expand_env_vars("pre-${CERTWARD_TEST_VAR}-post"), "pre-value-post");
        assert_eq!(expand_env_vars("${CERTWARD_UNSET_VAR_XYZ}"), "");
        assert_eq!(expand_env_vars("no vars"), "no vars");
        std::env::remove_var("CERTWARD_TEST_VAR");
    }

    #[test]
    fn test_template_file_is_valid() {
        let config = CertwardConfig::parse(&CertwardConfig::template_file()).unwrap();
        assert_eq!(config.namespaces.len(), 3);
        assert_eq!(config.templates.len(), 3);
        for entry in &config.templates {
            config.to_template(entry).unwrap();
        }

        let root = config.to_template(config.template("root-ca").unwrap()).unwrap();
        assert_eq!(
            root.lifetime_trigger,
            Some(LifetimeTrigger::LifetimePercentage(80))
        );
        let leaf = config.to_template(config.template("api-mtls").unwrap()).unwrap();
        assert_eq!(leaf.lifetime_trigger, Some(LifetimeTrigger::DaysBeforeExpiry(30)));
    }

    #[test]
    fn test_lifetime_trigger_needs_exactly_one_field() {
        let both = hierarchy_yaml().replace(
            "      days_before_expiry: 30\n",
            "      days_before_expiry: 30\n      lifetime_percentage: 80\n",
        );
        let err = CertwardConfig::parse(&both).unwrap_err();
        assert!(format!("{:#}", err).contains("exactly one of"));

        let neither = hierarchy_yaml().replace(
            "lifetime_trigger:\n      days_before_expiry: 30",
            "lifetime_trigger: {}",
        );
        assert!(CertwardConfig::parse(&neither).is_err());

        let unknown = hierarchy_yaml().replace("days_before_expiry: 30", "days_left: 30");
        assert!(CertwardConfig::parse(&unknown).is_err());
    }

    #[test]
    fn test_empty_config() {
        let config = CertwardConfig::parse("{}").unwrap();
        assert!(config.namespaces.is_empty());
        assert!(config.templates.is_empty());
    }
}
