//! Ingress reload controller library.
//!
//! Converges a reverse proxy's configuration to a set of routing resources:
//! annotations are extracted into directives, resolved into server
//! descriptors, rendered through templates and installed with a
//! test-apply-signal protocol that rolls back on failure.

// Convergence pipeline
pub mod annotations;
pub mod builder;
pub mod controller;
pub mod render;
pub mod resource;

// Proxy supervision
pub mod lifecycle;
pub mod proxy;

// Cross-cutting concerns
pub mod config;
pub mod observability;

pub use config::schema::ControllerConfig;
pub use controller::{Action, PassError, Reconciler};
pub use lifecycle::Shutdown;
pub use proxy::ReloadSupervisor;
