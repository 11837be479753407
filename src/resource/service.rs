//! Capabilities the core consumes from the cluster.
//!
//! # Responsibilities
//! - Resolve backend service references to declared ports
//! - Supply host names for certificate requests
//! - Fetch or request TLS material for a resource identity
//!
//! # Design Decisions
//! - Both capabilities are async traits; implementations typically hit the
//!   orchestration API
//! - A port of `0` means "unresolved" and is never rendered

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::ingress::{ResourceKey, RoutingResource, ServiceBackend, ServiceBackendPort};

/// `targetPort` of a service port: a number, or the name of a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetPort {
    Number(u16),
    Name(String),
}

/// A declared port of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    /// Port the service forwards to. A numeric value is preferred over `port`.
    #[serde(default)]
    pub target_port: Option<TargetPort>,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self {
            name: None,
            port,
            target_port: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn targeting(mut self, target_port: u16) -> Self {
        self.target_port = Some(TargetPort::Number(target_port));
        self
    }

    /// The port a proxy should dial.
    ///
    /// Named target ports live on the pods, so the service port is used.
    pub fn resolved(&self) -> u16 {
        match &self.target_port {
            Some(TargetPort::Number(port)) => *port,
            Some(TargetPort::Name(_)) | None => self.port,
        }
    }
}

/// What the resolver knows about a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub ports: Vec<ServicePort>,
}

impl ServiceInfo {
    /// Match a port reference by declared name or by number.
    pub fn resolve_port(&self, port: &ServiceBackendPort) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| {
                let by_name = matches!((&port.name, &p.name), (Some(want), Some(have)) if want == have);
                let by_number = port.number == Some(p.port);
                by_name || by_number
            })
            .map(ServicePort::resolved)
            .filter(|resolved| *resolved != 0)
    }

    /// First declared port, used where a reference carries no port.
    pub fn first_port(&self) -> Option<u16> {
        self.ports.first().map(ServicePort::resolved).filter(|p| *p != 0)
    }
}

/// Errors returned by a [`ServiceResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("service {name} not found in namespace {namespace}")]
    NotFound { namespace: String, name: String },

    #[error("service lookup failed: {0}")]
    Unavailable(String),
}

/// Service-resolution capability.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Look up a service by name.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceInfo, ResolveError>;

    /// Resolve a backend reference to a port, `0` when unresolved.
    async fn get_port(&self, namespace: &str, backend: &ServiceBackend) -> u16 {
        match self.get_service(namespace, &backend.name).await {
            Ok(service) => service.resolve_port(&backend.port).unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Host names a certificate for this resource should cover.
    async fn host_names(&self, resource: &RoutingResource) -> Vec<String> {
        if !resource.spec.rules.is_empty() {
            return resource
                .spec
                .rules
                .iter()
                .map(|rule| rule.host.clone())
                .filter(|host| !host.is_empty())
                .collect();
        }

        let Some(backend) = &resource.spec.default_backend else {
            return Vec::new();
        };
        match self.get_service(resource.namespace(), &backend.service.name).await {
            Ok(service) => {
                let dns = format!("{}.{}.svc", service.name, service.namespace);
                vec![format!("{}.cluster.local", dns), dns]
            }
            Err(_) => Vec::new(),
        }
    }
}

/// PEM-encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Errors returned by a [`CertificateProvider`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("no TLS material issued for {0} yet")]
    NotFound(ResourceKey),

    #[error("certificate automation unavailable: {0}")]
    Unavailable(String),
}

/// Certificate-automation collaborator.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Make sure an issuer and certificate exist for the identity.
    async fn ensure_certificate(
        &self,
        identity: &ResourceKey,
        host_names: &[String],
    ) -> Result<(), CertificateError>;

    /// Read issued material for the identity.
    async fn tls_material(&self, identity: &ResourceKey) -> Result<TlsMaterial, CertificateError>;
}
