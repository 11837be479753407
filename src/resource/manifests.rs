//! Manifest-directory backed resolver.
//!
//! Loads routing resources, services and issued TLS secrets from YAML files
//! so the controller can run without a cluster API. Also serves as the
//! in-memory resolver for tests.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::resource::ingress::{ObjectMeta, ResourceKey, RoutingResource};
use crate::resource::service::{
    CertificateError, CertificateProvider, ResolveError, ServiceInfo, ServicePort, ServiceResolver,
    TlsMaterial,
};

/// Secret name certificate automation issues material under.
pub fn secret_name_for(identity: &ResourceKey) -> String {
    format!("{}-secret", identity.name)
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// One YAML document.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum Manifest {
    Ingress(RoutingResource),
    Service(ServiceManifest),
    Secret(SecretManifest),
}

#[derive(Debug, Deserialize)]
struct ServiceManifest {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretManifest {
    metadata: ObjectMeta,
    #[serde(default)]
    string_data: BTreeMap<String, String>,
}

/// In-memory view of services, resources and TLS secrets.
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    resources: Vec<RoutingResource>,
    services: HashMap<(String, String), ServiceInfo>,
    secrets: HashMap<ResourceKey, TlsMaterial>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml` / `*.yml` file in a directory.
    ///
    /// Files are read in name order and may hold several documents.
    pub fn load_dir(dir: &Path) -> Result<Self, ManifestError> {
        let io_err = |path: &Path, source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(|e| io_err(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut store = Self::new();
        for path in paths {
            let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            store.load_str(&content).map_err(|source| ManifestError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        }

        tracing::debug!(
            dir = %dir.display(),
            resources = store.resources.len(),
            services = store.services.len(),
            secrets = store.secrets.len(),
            "Manifests loaded"
        );
        Ok(store)
    }

    /// Add every document in a YAML string.
    pub fn load_str(&mut self, content: &str) -> Result<(), serde_yaml::Error> {
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            match serde_yaml::from_value::<Manifest>(value)? {
                Manifest::Ingress(resource) => self.resources.push(resource),
                Manifest::Service(service) => {
                    self.insert_service(ServiceInfo {
                        name: service.metadata.name,
                        namespace: service.metadata.namespace,
                        ports: service.spec.ports,
                    });
                }
                Manifest::Secret(secret) => {
                    let cert = secret.string_data.get("tls.crt");
                    let key = secret.string_data.get("tls.key");
                    if let (Some(cert), Some(key)) = (cert, key) {
                        self.secrets.insert(
                            ResourceKey::new(secret.metadata.namespace, secret.metadata.name),
                            TlsMaterial {
                                cert_pem: cert.clone(),
                                key_pem: key.clone(),
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn with_service(mut self, service: ServiceInfo) -> Self {
        self.insert_service(service);
        self
    }

    pub fn with_resource(mut self, resource: RoutingResource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Register issued material for a resource identity.
    pub fn with_tls(mut self, identity: &ResourceKey, material: TlsMaterial) -> Self {
        self.secrets.insert(
            ResourceKey::new(&identity.namespace, secret_name_for(identity)),
            material,
        );
        self
    }

    fn insert_service(&mut self, service: ServiceInfo) {
        self.services
            .insert((service.namespace.clone(), service.name.clone()), service);
    }

    pub fn resources(&self) -> &[RoutingResource] {
        &self.resources
    }
}

#[async_trait]
impl ServiceResolver for ManifestStore {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceInfo, ResolveError> {
        self.services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl CertificateProvider for ManifestStore {
    async fn ensure_certificate(
        &self,
        identity: &ResourceKey,
        host_names: &[String],
    ) -> Result<(), CertificateError> {
        tracing::warn!(
            resource = %identity,
            hosts = ?host_names,
            secret = %secret_name_for(identity),
            "No certificate automation in manifest mode; add the secret manifest to enable TLS"
        );
        Ok(())
    }

    async fn tls_material(&self, identity: &ResourceKey) -> Result<TlsMaterial, CertificateError> {
        self.secrets
            .get(&ResourceKey::new(&identity.namespace, secret_name_for(identity)))
            .cloned()
            .ok_or_else(|| CertificateError::NotFound(identity.clone()))
    }
}
