//! Routing resource model.
//!
//! Mirrors the shape of a cluster ingress object closely enough that
//! manifests can be deserialized directly. The core only ever reads these
//! values; they are owned by whatever delivers the snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespaced identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}

/// A routing resource snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingResource {
    pub metadata: ObjectMeta,
    pub spec: RoutingSpec,
}

/// Desired routing of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingSpec {
    /// Backend serving requests no rule matches.
    pub default_backend: Option<Backend>,

    /// TLS material references.
    pub tls: Vec<TlsRef>,

    /// Host rules, in declaration order.
    pub rules: Vec<HostRule>,
}

/// Host rule: a host plus its ordered path entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRule {
    pub host: String,
    pub http: HttpRule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRule {
    pub paths: Vec<PathEntry>,
}

/// How a path value is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
    /// Matching is left to the proxy; required for regex paths.
    ImplementationSpecific,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEntry {
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub service: ServiceBackend,
}

/// Reference to a service port by name or number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBackend {
    pub name: String,
    #[serde(default)]
    pub port: ServiceBackendPort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBackendPort {
    pub name: Option<String>,
    pub number: Option<u16>,
}

impl fmt::Display for ServiceBackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.number) {
            (Some(name), _) => write!(f, "{}", name),
            (None, Some(number)) => write!(f, "{}", number),
            (None, None) => write!(f, "<unset>"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsRef {
    pub hosts: Vec<String>,
    pub secret_name: Option<String>,
}

impl RoutingResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.metadata.annotations
    }

    /// True when there is nothing to route yet.
    pub fn is_empty(&self) -> bool {
        self.spec.rules.is_empty() && self.spec.default_backend.is_none()
    }

    /// Every path entry across all host rules, in declaration order.
    pub fn path_entries(&self) -> impl Iterator<Item = &PathEntry> {
        self.spec.rules.iter().flat_map(|rule| rule.http.paths.iter())
    }
}

impl PathEntry {
    pub fn new(path: impl Into<String>, service: impl Into<String>, port: u16) -> Self {
        Self {
            path: path.into(),
            path_type: PathType::Prefix,
            backend: Backend::new(service, port),
        }
    }

    pub fn with_path_type(mut self, path_type: PathType) -> Self {
        self.path_type = path_type;
        self
    }
}

impl Backend {
    pub fn new(service: impl Into<String>, port: u16) -> Self {
        Self {
            service: ServiceBackend {
                name: service.into(),
                port: ServiceBackendPort {
                    name: None,
                    number: Some(port),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_ingress_shape() {
        let resource: RoutingResource = serde_json::from_str(
            r#"{
                "metadata": {"name": "site", "namespace": "web",
                             "annotations": {"a": "b"}},
                "spec": {
                    "tls": [{"hosts": ["example.com"]}],
                    "rules": [{
                        "host": "example.com",
                        "http": {"paths": [{
                            "path": "/api(/|$)(.*)",
                            "pathType": "ImplementationSpecific",
                            "backend": {"service": {"name": "api", "port": {"name": "http"}}}
                        }]}
                    }]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(resource.key(), ResourceKey::new("web", "site"));
        assert_eq!(resource.spec.tls[0].hosts, vec!["example.com"]);
        let entry = resource.path_entries().next().unwrap();
        assert_eq!(entry.path_type, PathType::ImplementationSpecific);
        assert_eq!(entry.backend.service.port.name.as_deref(), Some("http"));
        assert!(!resource.is_empty());
    }

    #[test]
    fn test_path_type_defaults_to_prefix() {
        let entry: PathEntry = serde_json::from_str(
            r#"{"path": "/", "backend": {"service": {"name": "web", "port": {"number": 80}}}}"#,
        )
        .unwrap();
        assert_eq!(entry.path_type, PathType::Prefix);
        assert_eq!(entry.backend.service.port.to_string(), "80");
    }

    #[test]
    fn test_empty_resource() {
        assert!(RoutingResource::default().is_empty());
    }
}
