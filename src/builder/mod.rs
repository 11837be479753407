//! Desired-state builder.
//!
//! # Data Flow
//! ```text
//! RoutingResource + DirectiveBundle
//!     → path checks (regex rewrite, weighted path consistency)
//!     → ServiceResolver: backend ref → service port
//!     → tls.rs: stage TLS material once per resource
//!     → Vec<ServerDescriptor> (one per host rule, or one wildcard server)
//! ```
//!
//! # Design Decisions
//! - All-or-nothing: any unresolved backend fails the whole build
//! - Descriptors carry no reference to the bundle; the renderer receives
//!   both side by side
//! - Default-backend resolution failure is operator-configurable

pub mod tls;

use serde::Serialize;
use thiserror::Error;

use crate::annotations::weight::check_path_consistency;
use crate::annotations::DirectiveBundle;
use crate::config::{ControllerConfig, DefaultBackendFallback};
use crate::resource::{
    Backend, CertificateProvider, PathType, ResourceKey, RoutingResource, ServiceResolver,
};

pub use tls::{TlsPaths, TlsStore};

/// Host match used for default-backend servers.
pub const WILDCARD_HOST: &str = "_";

/// Characters never allowed in a location path.
const FORBIDDEN_PATH_CHARS: &[char] = &[';', '{', '}', '"', '\'', '#', '`'];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0} declares neither rules nor a default backend")]
    NoRoutes(ResourceKey),

    #[error("backend {service}:{port} cannot be resolved in namespace {namespace}")]
    UnresolvedBackend {
        namespace: String,
        service: String,
        port: String,
    },

    #[error("path {path:?} of {resource} must use ImplementationSpecific when regex rewriting is enabled")]
    PathType { resource: ResourceKey, path: String },

    #[error("path {path:?} of {resource} is not a valid location")]
    InvalidPath { resource: ResourceKey, path: String },

    #[error("{0}")]
    PathConsistency(String),
}

/// A resolved backend location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    /// Service name.
    pub name: String,
    pub namespace: String,
    pub path: String,
    pub path_type: PathType,
    /// `<svc>.<ns>.<domain>:<port>`
    pub target: String,
    pub port: u16,
    pub rewrite_target: Option<String>,
}

/// A virtual server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDescriptor {
    /// Owning resource name.
    pub name: String,
    pub namespace: String,
    /// Host match, [`WILDCARD_HOST`] for default-backend servers.
    pub host: String,
    pub tls: Option<TlsPaths>,
    pub backends: Vec<BackendDescriptor>,
    /// Answer every request with 503 (unresolvable default backend).
    pub error_page: bool,
}

impl ServerDescriptor {
    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD_HOST
    }
}

/// Whether a build may touch TLS state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStaging {
    /// Write material into the TLS directory and request missing certificates.
    Install,
    /// Report where usable material would go; write and request nothing.
    DryRun,
}

/// Builds server descriptors for one resource at a time. Holds no per-pass state.
#[derive(Debug, Clone)]
pub struct DesiredStateBuilder {
    service_domain: String,
    fallback: DefaultBackendFallback,
    tls: TlsStore,
}

impl DesiredStateBuilder {
    pub fn new(config: &ControllerConfig) -> Self {
        Self::with_parts(
            &config.reconcile.service_domain,
            config.reconcile.default_backend_fallback,
            TlsStore::new(&config.proxy.tls_dir),
        )
    }

    pub fn with_parts(
        service_domain: impl Into<String>,
        fallback: DefaultBackendFallback,
        tls: TlsStore,
    ) -> Self {
        Self {
            service_domain: service_domain.into(),
            fallback,
            tls,
        }
    }

    /// Resolve a resource into server descriptors, staging its TLS material.
    pub async fn build(
        &self,
        resource: &RoutingResource,
        bundle: &DirectiveBundle,
        resolver: &dyn ServiceResolver,
        certs: &dyn CertificateProvider,
    ) -> Result<Vec<ServerDescriptor>, BuildError> {
        self.build_with(resource, bundle, resolver, certs, TlsStaging::Install)
            .await
    }

    pub async fn build_with(
        &self,
        resource: &RoutingResource,
        bundle: &DirectiveBundle,
        resolver: &dyn ServiceResolver,
        certs: &dyn CertificateProvider,
        staging: TlsStaging,
    ) -> Result<Vec<ServerDescriptor>, BuildError> {
        if resource.is_empty() {
            return Err(BuildError::NoRoutes(resource.key()));
        }

        self.check_paths(resource, bundle)?;

        let servers = if resource.spec.rules.is_empty() {
            self.default_server(resource, resolver).await?
        } else {
            self.rule_servers(resource, bundle, resolver).await?
        };

        let tls = match staging {
            TlsStaging::Install => self.tls.stage(resource, resolver, certs).await,
            TlsStaging::DryRun => self.tls.inspect(resource, certs).await,
        };
        let servers = servers
            .into_iter()
            .map(|server| ServerDescriptor {
                tls: tls.clone(),
                ..server
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            resource = %resource.key(),
            servers = servers.len(),
            tls = tls.is_some(),
            "Desired state built"
        );
        Ok(servers)
    }

    fn check_paths(
        &self,
        resource: &RoutingResource,
        bundle: &DirectiveBundle,
    ) -> Result<(), BuildError> {
        for entry in resource.path_entries() {
            if !is_valid_path(&entry.path) {
                return Err(BuildError::InvalidPath {
                    resource: resource.key(),
                    path: entry.path.clone(),
                });
            }
            if bundle.requires_regex_paths() && entry.path_type != PathType::ImplementationSpecific {
                return Err(BuildError::PathType {
                    resource: resource.key(),
                    path: entry.path.clone(),
                });
            }
        }

        if bundle.weight.is_some() {
            check_path_consistency(resource)
                .map_err(|err| BuildError::PathConsistency(err.to_string()))?;
        }
        Ok(())
    }

    async fn default_server(
        &self,
        resource: &RoutingResource,
        resolver: &dyn ServiceResolver,
    ) -> Result<Vec<ServerDescriptor>, BuildError> {
        let Some(backend) = &resource.spec.default_backend else {
            return Err(BuildError::NoRoutes(resource.key()));
        };

        let mut server = self.server(resource, WILDCARD_HOST);
        match self.backend(resource, "/", PathType::Prefix, backend, None, resolver).await {
            Ok(descriptor) => server.backends.push(descriptor),
            Err(err) if self.fallback == DefaultBackendFallback::ErrorPage => {
                tracing::warn!(resource = %resource.key(), error = %err, "Default backend unresolved, serving error page");
                server.error_page = true;
            }
            Err(err) => return Err(err),
        }
        Ok(vec![server])
    }

    async fn rule_servers(
        &self,
        resource: &RoutingResource,
        bundle: &DirectiveBundle,
        resolver: &dyn ServiceResolver,
    ) -> Result<Vec<ServerDescriptor>, BuildError> {
        let rewrite_target = bundle.rewrite.as_ref().and_then(|r| r.target.as_deref());

        let mut servers = Vec::with_capacity(resource.spec.rules.len());
        for rule in &resource.spec.rules {
            let host = if rule.host.is_empty() {
                WILDCARD_HOST
            } else {
                rule.host.as_str()
            };
            let mut server = self.server(resource, host);
            for entry in &rule.http.paths {
                let descriptor = self
                    .backend(
                        resource,
                        &entry.path,
                        entry.path_type,
                        &entry.backend,
                        rewrite_target,
                        resolver,
                    )
                    .await?;
                server.backends.push(descriptor);
            }
            servers.push(server);
        }
        Ok(servers)
    }

    fn server(&self, resource: &RoutingResource, host: &str) -> ServerDescriptor {
        ServerDescriptor {
            name: resource.name().to_string(),
            namespace: resource.namespace().to_string(),
            host: host.to_string(),
            tls: None,
            backends: Vec::new(),
            error_page: false,
        }
    }

    async fn backend(
        &self,
        resource: &RoutingResource,
        path: &str,
        path_type: PathType,
        backend: &Backend,
        rewrite_target: Option<&str>,
        resolver: &dyn ServiceResolver,
    ) -> Result<BackendDescriptor, BuildError> {
        let namespace = resource.namespace();
        let service = &backend.service;

        let port = resolver.get_port(namespace, service).await;
        if port == 0 {
            return Err(BuildError::UnresolvedBackend {
                namespace: namespace.to_string(),
                service: service.name.clone(),
                port: service.port.to_string(),
            });
        }

        Ok(BackendDescriptor {
            name: service.name.clone(),
            namespace: namespace.to_string(),
            path: if path.is_empty() { "/" } else { path }.to_string(),
            path_type,
            target: format!("{}.{}.{}:{}", service.name, namespace, self.service_domain, port),
            port,
            rewrite_target: rewrite_target.map(str::to_string),
        })
    }
}

fn is_valid_path(path: &str) -> bool {
    (path.is_empty() || path.starts_with('/'))
        && !path.contains(FORBIDDEN_PATH_CHARS)
        && !path.chars().any(char::is_whitespace)
        && !path.ends_with('\\')
}
