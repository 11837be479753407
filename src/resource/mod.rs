//! Routing resources and the cluster capabilities around them.
//!
//! # Data Flow
//! ```text
//! resource watcher (external) / manifests.rs
//!     → RoutingResource snapshot (read-only)
//!     → annotations + builder consume it
//!
//! builder / weight parser
//!     → ServiceResolver (service ports, host names)
//!     → CertificateProvider (TLS material)
//! ```

pub mod ingress;
pub mod manifests;
pub mod service;

pub use ingress::{
    Backend, HostRule, HttpRule, ObjectMeta, PathEntry, PathType, ResourceKey, RoutingResource,
    RoutingSpec, ServiceBackend, ServiceBackendPort, TlsRef,
};
pub use manifests::{ManifestError, ManifestStore};
pub use service::{
    CertificateError, CertificateProvider, ResolveError, ServiceInfo, ServicePort, ServiceResolver,
    TargetPort, TlsMaterial,
};
