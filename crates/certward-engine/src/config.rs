//! Engine configuration
//!
//! Well-known CA namespaces are injected here rather than compiled in, so
//! tests and separate deployments can supply their own namespace sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of namespace a template or certificate lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamespaceKind {
    RootCa,
    IntermediateCa,
    ServicePrincipal,
    Application,
    Device,
    Group,
    User,
}

impl NamespaceKind {
    pub fn is_ca(self) -> bool {
        matches!(self, NamespaceKind::RootCa | NamespaceKind::IntermediateCa)
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NamespaceKind::RootCa => "root-ca",
            NamespaceKind::IntermediateCa => "intermediate-ca",
            NamespaceKind::ServicePrincipal => "service-principal",
            NamespaceKind::Application => "application",
            NamespaceKind::Device => "device",
            NamespaceKind::Group => "group",
            NamespaceKind::User => "user",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Namespaces hosting root CAs
    #[serde(default)]
    pub root_ca_namespaces: Vec<Uuid>,

    /// Namespaces hosting intermediate CAs
    #[serde(default)]
    pub intermediate_ca_namespaces: Vec<Uuid>,

    /// Fall back to RS384 when a CA declares no signature algorithm.
    /// Only acceptable for internal or test CAs.
    #[serde(default)]
    pub allow_development_defaults: bool,
}

impl EngineConfig {
    pub fn with_root_ca_namespace(mut self, namespace_id: Uuid) -> Self {
        self.root_ca_namespaces.push(namespace_id);
        self
    }

    pub fn with_intermediate_ca_namespace(mut self, namespace_id: Uuid) -> Self {
        self.intermediate_ca_namespaces.push(namespace_id);
        self
    }

    pub fn with_development_defaults(mut self, enabled: bool) -> Self {
        self.allow_development_defaults = enabled;
        self
    }

    /// Kind of a configured CA namespace, `None` for everything else
    pub fn ca_namespace_kind(&self, namespace_id: Uuid) -> Option<NamespaceKind> {
        if self.root_ca_namespaces.contains(&namespace_id) {
            Some(NamespaceKind::RootCa)
        } else if self.intermediate_ca_namespaces.contains(&namespace_id) {
            Some(NamespaceKind::IntermediateCa)
        } else {
            None
        }
    }
}
