//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use ingress_reload::config::{ControllerConfig, ProxyProcessConfig};
use ingress_reload::proxy::{ConfigPaths, ProcessControl, ProcessError, ReloadSupervisor};
use ingress_reload::render::Renderer;
use ingress_reload::resource::{
    HostRule, HttpRule, ManifestStore, PathEntry, RoutingResource, ServiceInfo, ServicePort,
};
use ingress_reload::{Reconciler, Shutdown};

pub const PREFIX: &str = "ingress.nginx.kubebuilder.io";

/// Process double with switchable failures and call counters.
#[derive(Default)]
pub struct MockProcess {
    pub fail_test: AtomicBool,
    pub fail_signal: AtomicBool,
    pub dead: AtomicBool,
    pub tests: AtomicUsize,
    pub signals: AtomicUsize,
    pub launches: AtomicUsize,
}

impl MockProcess {
    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    pub fn tests(&self) -> usize {
        self.tests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for MockProcess {
    async fn test_config(&self, path: &Path) -> Result<(), ProcessError> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        assert!(path.exists(), "test file must exist while it is checked");
        if self.fail_test.load(Ordering::SeqCst) {
            Err(ProcessError::TestFailed("nginx: [emerg] unexpected \"}\"".into()))
        } else {
            Ok(())
        }
    }

    async fn signal_reload(&self) -> Result<(), ProcessError> {
        self.signals.fetch_add(1, Ordering::SeqCst);
        if self.fail_signal.load(Ordering::SeqCst) {
            Err(ProcessError::InvalidPid(String::new()))
        } else {
            Ok(())
        }
    }

    async fn is_running(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn launch(&self) -> Result<(), ProcessError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Temporary on-disk layout plus a config pointing into it.
pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub config: ControllerConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControllerConfig::default();
        config.proxy = ProxyProcessConfig {
            config_file: dir.path().join("nginx.conf"),
            pid_file: dir.path().join("nginx.pid"),
            tls_dir: dir.path().join("ssl"),
            ..Default::default()
        };
        Self { dir, config }
    }

    pub fn installed(&self) -> String {
        std::fs::read_to_string(&self.config.proxy.config_file).unwrap_or_default()
    }

    pub fn supervisor(&self, process: Arc<MockProcess>) -> Arc<ReloadSupervisor> {
        Arc::new(ReloadSupervisor::new(ConfigPaths::new(&self.config.proxy), process))
    }

    pub fn supervisor_with_shutdown(
        &self,
        process: Arc<MockProcess>,
        shutdown: Shutdown,
    ) -> Arc<ReloadSupervisor> {
        Arc::new(
            ReloadSupervisor::new(ConfigPaths::new(&self.config.proxy), process)
                .with_shutdown(shutdown),
        )
    }

    pub fn reconciler(&self, store: ManifestStore, supervisor: Arc<ReloadSupervisor>) -> Reconciler {
        let store = Arc::new(store);
        let renderer = Renderer::new(&self.config.templates, &self.config.proxy.pid_file).unwrap();
        Reconciler::new(&self.config, renderer, supervisor, store.clone(), store)
    }
}

pub fn service(name: &str, port: u16, target_port: u16) -> ServiceInfo {
    ServiceInfo {
        name: name.into(),
        namespace: "ns".into(),
        ports: vec![ServicePort::new(port).targeting(target_port)],
    }
}

/// Resource in namespace `ns` with one host rule.
pub fn resource(name: &str, host: &str, paths: Vec<PathEntry>) -> RoutingResource {
    let mut resource = RoutingResource::default();
    resource.metadata.name = name.into();
    resource.metadata.namespace = "ns".into();
    resource.spec.rules.push(HostRule {
        host: host.into(),
        http: HttpRule { paths },
    });
    resource
}

/// Attach prefixed annotations.
pub fn annotate(mut resource: RoutingResource, values: &[(&str, &str)]) -> RoutingResource {
    let annotations: BTreeMap<String, String> = values
        .iter()
        .map(|(k, v)| (format!("{}/{}", PREFIX, k), v.to_string()))
        .collect();
    resource.metadata.annotations.extend(annotations);
    resource
}
