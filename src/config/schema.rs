//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the controller.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the ingress reload controller.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    /// Proxy binary, process and on-disk layout.
    pub proxy: ProxyProcessConfig,

    /// Template assets and master-template settings.
    pub templates: TemplateConfig,

    /// Annotation extraction settings.
    pub annotations: AnnotationConfig,

    /// Convergence pass settings.
    pub reconcile: ReconcileConfig,

    /// Filesystem change-watch settings.
    pub watch: WatchConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Proxy process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyProcessConfig {
    /// Path to the proxy binary.
    pub binary: PathBuf,

    /// Executable name as it appears in the process table.
    pub process_name: String,

    /// File the proxy records its master process id in.
    pub pid_file: PathBuf,

    /// Installed configuration file.
    pub config_file: PathBuf,

    /// Directory holding PEM-encoded TLS material.
    pub tls_dir: PathBuf,

    /// Deadline for the configuration-check invocation, in seconds.
    pub test_timeout_secs: u64,

    /// How long to wait for the proxy to appear after launch, in seconds.
    pub startup_timeout_secs: u64,

    /// Process-table poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl ProxyProcessConfig {
    /// Side file the candidate configuration is tested from.
    pub fn test_file(&self) -> PathBuf {
        with_suffix(&self.config_file, ".test")
    }

    /// Copy of the installed file taken before replacement.
    pub fn backup_file(&self) -> PathBuf {
        with_suffix(&self.config_file, ".bak")
    }
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

impl Default for ProxyProcessConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/nginx"),
            process_name: "nginx".to_string(),
            pid_file: PathBuf::from("/var/run/nginx.pid"),
            config_file: PathBuf::from("/etc/nginx/nginx.conf"),
            tls_dir: PathBuf::from("/etc/nginx/ssl"),
            test_timeout_secs: 30,
            startup_timeout_secs: 10,
            poll_interval_ms: 200,
        }
    }
}

/// Template configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Directory overriding the embedded templates. Missing files fall back
    /// to the embedded version.
    pub dir: Option<PathBuf>,

    /// `worker_processes` value for the master template.
    pub worker_processes: String,

    /// `worker_connections` value for the master template.
    pub worker_connections: u32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            worker_processes: "auto".to_string(),
            worker_connections: 1024,
        }
    }
}

/// Annotation extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Prefix every recognised annotation key lives under.
    pub prefix: String,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            prefix: "ingress.nginx.kubebuilder.io".to_string(),
        }
    }
}

/// What to do when a default backend cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultBackendFallback {
    /// Abort the pass.
    #[default]
    Fail,
    /// Serve a wildcard server answering 503.
    ErrorPage,
}

/// Convergence pass configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Requeue delay for resources that are not ready yet, in seconds.
    pub not_ready_requeue_secs: u64,

    /// Requeue delay after a failed pass, in seconds.
    pub failure_requeue_secs: u64,

    /// Domain suffix used to address services (`<svc>.<ns>.<domain>`).
    pub service_domain: String,

    /// Behaviour when the default backend cannot be resolved.
    pub default_backend_fallback: DefaultBackendFallback,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            not_ready_requeue_secs: 11,
            failure_requeue_secs: 15,
            service_domain: "svc".to_string(),
            default_backend_fallback: DefaultBackendFallback::Fail,
        }
    }
}

/// Change-watch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period collapsing bursts of events, in milliseconds.
    pub debounce_ms: u64,

    /// Poll interval for the fallback poll watcher, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            poll_interval_secs: 2,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_files_sit_beside_installed_file() {
        let config = ProxyProcessConfig::default();
        assert_eq!(config.test_file(), PathBuf::from("/etc/nginx/nginx.conf.test"));
        assert_eq!(config.backup_file(), PathBuf::from("/etc/nginx/nginx.conf.bak"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ControllerConfig = toml::from_str(
            r#"
            [proxy]
            config_file = "/tmp/nginx.conf"

            [reconcile]
            default_backend_fallback = "error-page"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.config_file, PathBuf::from("/tmp/nginx.conf"));
        assert_eq!(config.proxy.process_name, "nginx");
        assert_eq!(
            config.reconcile.default_backend_fallback,
            DefaultBackendFallback::ErrorPage
        );
        assert_eq!(config.reconcile.failure_requeue_secs, 15);
        assert_eq!(config.annotations.prefix, "ingress.nginx.kubebuilder.io");
    }
}
