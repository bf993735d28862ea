//! Subject and SAN template rendering
//!
//! Template strings reference binding variables as `${name}`. Rendering never
//! fails: any unknown variable or malformed reference renders the whole string
//! as empty.

use regex_lite::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

/// Well-known binding variable names
pub mod vars {
    pub const DEVICE_URI: &str = "device.uri";
    pub const APPLICATION_URI: &str = "application.uri";
    pub const SERVICE_PRINCIPAL_URI: &str = "service_principal.uri";
    pub const GROUP_URI: &str = "group.uri";
    pub const REQUEST_FQDN: &str = "request.fqdn";
    pub const NAMESPACE_ID: &str = "namespace.id";
}

/// Binding variables available to a render call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    variables: BTreeMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn with_device_uri(self, uri: impl Into<String>) -> Self {
        self.with(vars::DEVICE_URI, uri)
    }

    pub fn with_application_uri(self, uri: impl Into<String>) -> Self {
        self.with(vars::APPLICATION_URI, uri)
    }

    pub fn with_service_principal_uri(self, uri: impl Into<String>) -> Self {
        self.with(vars::SERVICE_PRINCIPAL_URI, uri)
    }

    pub fn with_group_uri(self, uri: impl Into<String>) -> Self {
        self.with(vars::GROUP_URI, uri)
    }

    pub fn with_request_fqdn(self, fqdn: impl Into<String>) -> Self {
        self.with(vars::REQUEST_FQDN, fqdn)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RenderContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            variables: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

pub trait TemplateRenderer: Send + Sync {
    /// Render `template` against `context`; errors produce an empty string
    fn render(&self, template: &str, context: &RenderContext) -> String;
}

/// `${name}` substitution renderer
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableRenderer;

fn variable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}]*)\}").ok())
        .as_ref()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

impl VariableRenderer {
    fn try_render(&self, template: &str, context: &RenderContext) -> Result<String, String> {
        let pattern = variable_pattern().ok_or("variable pattern unavailable")?;

        let mut rendered = String::with_capacity(template.len());
        let mut last = 0;
        for caps in pattern.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str().trim();
            if !is_valid_name(name) {
                return Err(format!("invalid variable reference '{}'", name));
            }
            let value = context
                .get(name)
                .ok_or_else(|| format!("unknown variable '{}'", name))?;

            push_literal(&mut rendered, &template[last..whole.start()])?;
            rendered.push_str(value);
            last = whole.end();
        }
        push_literal(&mut rendered, &template[last..])?;

        Ok(rendered)
    }
}

fn push_literal(out: &mut String, literal: &str) -> Result<(), String> {
    if literal.contains("${") {
        return Err("unterminated variable reference".to_string());
    }
    out.push_str(literal);
    Ok(())
}

impl TemplateRenderer for VariableRenderer {
    fn render(&self, template: &str, context: &RenderContext) -> String {
        match self.try_render(template, context) {
            Ok(rendered) => rendered,
            Err(reason) => {
                debug!("Template '{}' rendered empty: {}", template, reason);
                String::new()
            }
        }
    }
}
