//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0)
//! - Check that the on-disk layout is coherent
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ControllerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use regex::Regex;

use crate::config::schema::ControllerConfig;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ControllerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let proxy = &config.proxy;

    if proxy.binary.as_os_str().is_empty() {
        errors.push(ValidationError::new("proxy.binary", "must not be empty"));
    }
    if proxy.process_name.trim().is_empty() {
        errors.push(ValidationError::new("proxy.process_name", "must not be empty"));
    }

    for (field, path) in [
        ("proxy.pid_file", &proxy.pid_file),
        ("proxy.config_file", &proxy.config_file),
        ("proxy.tls_dir", &proxy.tls_dir),
    ] {
        if !path.is_absolute() {
            errors.push(ValidationError::new(
                field,
                format!("must be an absolute path, got {}", path.display()),
            ));
        }
    }

    if proxy.config_file.file_name().is_none() {
        errors.push(ValidationError::new("proxy.config_file", "must name a file"));
    }

    if proxy.test_timeout_secs == 0 {
        errors.push(ValidationError::new("proxy.test_timeout_secs", "must be greater than zero"));
    }
    if proxy.startup_timeout_secs == 0 {
        errors.push(ValidationError::new("proxy.startup_timeout_secs", "must be greater than zero"));
    }
    if proxy.poll_interval_ms == 0 {
        errors.push(ValidationError::new("proxy.poll_interval_ms", "must be greater than zero"));
    }

    if config.reconcile.not_ready_requeue_secs == 0 || config.reconcile.failure_requeue_secs == 0 {
        errors.push(ValidationError::new("reconcile", "requeue delays must be greater than zero"));
    }
    if config.reconcile.service_domain.trim().is_empty() {
        errors.push(ValidationError::new("reconcile.service_domain", "must not be empty"));
    }

    let prefix_pattern = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .map_err(|e| vec![ValidationError::new("annotations.prefix", e.to_string())])?;
    if !prefix_pattern.is_match(&config.annotations.prefix) {
        errors.push(ValidationError::new(
            "annotations.prefix",
            format!("{:?} is not a valid DNS subdomain", config.annotations.prefix),
        ));
    }

    if config.watch.debounce_ms == 0 {
        errors.push(ValidationError::new("watch.debounce_ms", "must be greater than zero"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
