//! Orchestration descriptor (docker-compose.yml) model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::binding::{MappingError, PortMapping};
use super::finding::Finding;

#[derive(Debug, Error, PartialEq)]
pub enum ComposeError {
    #[error("invalid compose file: {0}")]
    Yaml(String),
    #[error("cannot interpolate '{input}': {reason}")]
    Interpolation { input: String, reason: String },
    #[error("service '{service}': {source}")]
    Port {
        service: String,
        #[source]
        source: MappingError,
    },
    #[error("service '{0}' declares neither build nor image")]
    MissingSource(String),
    #[error("service '{0}' not found")]
    UnknownService(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ComposeFile {
    /// Deprecated schema marker; kept only so it can be reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<serde_yaml_ng::Value>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BuildSpec {
    Context(String),
    Detailed {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
    },
}

impl BuildSpec {
    pub fn context(&self) -> &str {
        match self {
            BuildSpec::Context(c) => c,
            BuildSpec::Detailed { context, .. } => context.as_deref().unwrap_or("."),
        }
    }

    pub fn dockerfile(&self) -> &str {
        match self {
            BuildSpec::Context(_) => "Dockerfile",
            BuildSpec::Detailed { dockerfile, .. } => dockerfile.as_deref().unwrap_or("Dockerfile"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Text(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScalarValue {
    fn render(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Environment {
    List(Vec<String>),
    Map(BTreeMap<String, Option<ScalarValue>>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub build: Option<BuildSpec>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
}

/// Host directory made visible inside the container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BindMount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl BindMount {
    /// Parse `host:container[:mode]`. Named volumes are not overlays and yield `None`.
    pub fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, None),
            [host, container, mode] => (*host, *container, Some(*mode)),
            _ => return None,
        };
        if !(host.starts_with('.') || host.starts_with('/') || host.starts_with('~')) {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            container: container.to_string(),
            read_only: mode.map(|m| m.split(',').any(|o| o == "ro")).unwrap_or(false),
        })
    }
}

/// A service with variables interpolated and ports parsed.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedService {
    pub name: String,
    pub container_name: Option<String>,
    pub build: Option<BuildSpec>,
    pub image: Option<String>,
    pub ports: Vec<PortMapping>,
    pub overlays: Vec<BindMount>,
    pub environment: BTreeMap<String, String>,
}

impl ResolvedService {
    /// Port the service's process binds: its own PORT variable, else the default.
    pub fn process_port(&self, default_port: u16) -> u16 {
        self.environment
            .get("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(default_port)
    }
}

impl ComposeFile {
    pub fn parse(text: &str) -> Result<Self, ComposeError> {
        serde_yaml_ng::from_str(text).map_err(|e| ComposeError::Yaml(e.to_string()))
    }

    pub fn resolve_service<F>(&self, name: &str, lookup: F) -> Result<ResolvedService, ComposeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let spec = self
            .services
            .get(name)
            .ok_or_else(|| ComposeError::UnknownService(name.to_string()))?;
        if spec.build.is_none() && spec.image.is_none() {
            return Err(ComposeError::MissingSource(name.to_string()));
        }

        let mut ports = Vec::new();
        for entry in &spec.ports {
            let text = match entry {
                PortEntry::Number(n) => n.to_string(),
                PortEntry::Text(t) => interpolate(t, &lookup)?,
            };
            ports.push(PortMapping::parse(&text).map_err(|source| ComposeError::Port {
                service: name.to_string(),
                source,
            })?);
        }

        let mut overlays = Vec::new();
        for volume in &spec.volumes {
            if let Some(mount) = BindMount::parse(&interpolate(volume, &lookup)?) {
                overlays.push(mount);
            }
        }

        let mut environment = BTreeMap::new();
        match &spec.environment {
            Environment::List(items) => {
                for item in items {
                    let item = interpolate(item, &lookup)?;
                    match item.split_once('=') {
                        Some((k, v)) => {
                            environment.insert(k.to_string(), v.to_string());
                        }
                        // bare KEY passes the host value through
                        None => {
                            if let Some(v) = lookup(&item) {
                                environment.insert(item, v);
                            }
                        }
                    }
                }
            }
            Environment::Map(map) => {
                for (key, value) in map {
                    let value = match value {
                        Some(v) => interpolate(&v.render(), &lookup)?,
                        None => match lookup(key) {
                            Some(v) => v,
                            None => continue,
                        },
                    };
                    environment.insert(key.clone(), value);
                }
            }
        }

        Ok(ResolvedService {
            name: name.to_string(),
            container_name: spec.container_name.clone(),
            build: spec.build.clone(),
            image: spec.image.clone(),
            ports,
            overlays,
            environment,
        })
    }

    /// Check every service. Returns the services that resolved and all findings.
    pub fn check<F>(&self, subject: &str, default_port: u16, lookup: F) -> (Vec<ResolvedService>, Vec<Finding>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut findings = Vec::new();
        let mut resolved = Vec::new();

        if self.version.is_some() {
            findings.push(Finding::warning(
                subject,
                "top-level 'version' is deprecated and ignored; remove it",
            ));
        }
        if self.services.is_empty() {
            findings.push(Finding::error(subject, "no services declared"));
        }

        for name in self.services.keys() {
            let service = match self.resolve_service(name, &lookup) {
                Ok(service) => service,
                Err(e) => {
                    findings.push(Finding::error(subject, e.to_string()));
                    continue;
                }
            };

            let port = service.process_port(default_port);
            if service.ports.is_empty() {
                findings.push(Finding::warning(
                    subject,
                    format!("service '{}' publishes no ports; it is unreachable from the host", name),
                ));
            } else if !service.ports.iter().any(|m| m.container_port == port) {
                let declared: Vec<String> = service.ports.iter().map(|m| m.to_string()).collect();
                findings.push(Finding::error(
                    subject,
                    format!(
                        "service '{}' maps {} but its process binds port {}; published traffic will be refused",
                        name,
                        declared.join(", "),
                        port
                    ),
                ));
            }

            resolved.push(service);
        }

        (resolved, findings)
    }
}

/// Expand `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$$`.
pub fn interpolate<F>(input: &str, lookup: F) -> Result<String, ComposeError>
where
    F: Fn(&str) -> Option<String>,
{
    let fail = |reason: &str| ComposeError::Interpolation {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(fail("unterminated ${"));
                }
                let (name, value) = if let Some((name, default)) = body.split_once(":-") {
                    let value = lookup(name)
                        .filter(|v| !v.is_empty())
                        .unwrap_or_else(|| default.to_string());
                    (name, value)
                } else if let Some((name, default)) = body.split_once('-') {
                    (name, lookup(name).unwrap_or_else(|| default.to_string()))
                } else {
                    (body.as_str(), lookup(&body).unwrap_or_default())
                };
                if !is_var_name(name) {
                    return Err(fail("invalid variable name"));
                }
                out.push_str(&value);
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
