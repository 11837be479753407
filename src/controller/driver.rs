//! Manifest-directory driver.
//!
//! Stands in for the cluster watch machinery: routing resources, services and
//! TLS secrets come from a directory of YAML manifests. Each resource gets its
//! own worker task; snapshots for one resource are processed strictly in order
//! and a newer snapshot supersedes a pending requeue.
//!
//! # Data Flow
//! ```text
//! manifest dir ──notify──▶ reload store ──▶ deliver all
//! SIGHUP ─────────────▶ reload store ──▶ deliver all
//!                                             │
//!                     per resource worker ◀───┘  (removed keys → forget)
//!                       → Reconciler::reconcile → Action / PassError
//!                       → requeue after delay | wait for next snapshot
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::WatchConfig;
use crate::controller::{Action, Reconciler};
use crate::lifecycle::Shutdown;
use crate::resource::{
    CertificateError, CertificateProvider, ManifestError, ManifestStore, ResolveError, ResourceKey,
    RoutingResource, ServiceInfo, ServiceResolver, TlsMaterial,
};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Manifests(#[from] ManifestError),

    #[error("failed to watch manifest directory {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("reload supervisor halted; the proxy needs operator attention")]
    Halted,
}

/// Manifest store that can be swapped while passes are running.
#[derive(Debug)]
pub struct LiveManifests {
    dir: PathBuf,
    current: ArcSwap<ManifestStore>,
}

impl LiveManifests {
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let dir = dir.into();
        let store = ManifestStore::load_dir(&dir)?;
        Ok(Self::from_store(dir, store))
    }

    pub fn from_store(dir: impl Into<PathBuf>, store: ManifestStore) -> Self {
        Self {
            dir: dir.into(),
            current: ArcSwap::from_pointee(store),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the directory. The previous store stays in place on error.
    pub fn reload(&self) -> Result<(), ManifestError> {
        let store = ManifestStore::load_dir(&self.dir)?;
        tracing::info!(dir = %self.dir.display(), resources = store.resources().len(), "Manifests reloaded");
        self.current.store(Arc::new(store));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<ManifestStore> {
        self.current.load_full()
    }
}

#[async_trait]
impl ServiceResolver for LiveManifests {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceInfo, ResolveError> {
        self.snapshot().get_service(namespace, name).await
    }
}

#[async_trait]
impl CertificateProvider for LiveManifests {
    async fn ensure_certificate(
        &self,
        identity: &ResourceKey,
        host_names: &[String],
    ) -> Result<(), CertificateError> {
        self.snapshot().ensure_certificate(identity, host_names).await
    }

    async fn tls_material(&self, identity: &ResourceKey) -> Result<TlsMaterial, CertificateError> {
        self.snapshot().tls_material(identity).await
    }
}

/// Delivers manifest snapshots to the reconciler until shutdown.
pub struct Driver {
    reconciler: Arc<Reconciler>,
    manifests: Arc<LiveManifests>,
    debounce: Duration,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl Driver {
    pub fn new(
        reconciler: Arc<Reconciler>,
        manifests: Arc<LiveManifests>,
        watch: &WatchConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            reconciler,
            manifests,
            debounce: Duration::from_millis(watch.debounce_ms),
            poll_interval: Duration::from_secs(watch.poll_interval_secs),
            shutdown,
        }
    }

    /// Run until shutdown. Returns [`DriverError::Halted`] when the stop was
    /// caused by a fatal proxy failure.
    pub async fn run(self, mut resync: mpsc::UnboundedReceiver<()>) -> Result<(), DriverError> {
        let mut stopped = self.shutdown.subscribe();
        let (_watcher, mut changes) = self.watch_manifests()?;
        let mut workers = HashMap::new();

        if !self.shutdown.is_triggered() {
            self.deliver_all(&mut workers).await;
            loop {
                tokio::select! {
                    _ = stopped.recv() => break,
                    Some(()) = resync.recv() => self.refresh(&mut workers).await,
                    Some(()) = changes.recv() => {
                        let window = tokio::time::sleep(self.debounce);
                        tokio::pin!(window);
                        loop {
                            tokio::select! {
                                _ = &mut window => break,
                                more = changes.recv() => if more.is_none() { break },
                            }
                        }
                        self.refresh(&mut workers).await;
                    }
                }
            }
        }

        drop(workers);
        tracing::info!("Driver stopped");
        if self.reconciler.supervisor().is_halted() {
            Err(DriverError::Halted)
        } else {
            Ok(())
        }
    }

    /// Re-read the manifest directory, then redeliver.
    async fn refresh(&self, workers: &mut HashMap<ResourceKey, mpsc::UnboundedSender<RoutingResource>>) {
        match self.manifests.reload() {
            Ok(()) => self.deliver_all(workers).await,
            Err(err) => tracing::warn!(error = %err, "Keeping previous manifests"),
        }
    }

    /// Send the current snapshot of every resource to its worker.
    async fn deliver_all(&self, workers: &mut HashMap<ResourceKey, mpsc::UnboundedSender<RoutingResource>>) {
        let store = self.manifests.snapshot();
        let current: BTreeMap<ResourceKey, &RoutingResource> =
            store.resources().iter().map(|r| (r.key(), r)).collect();

        // Views outlive their worker when an earlier removal failed.
        let removed: BTreeSet<ResourceKey> = workers
            .keys()
            .cloned()
            .chain(self.reconciler.views().into_iter().map(|view| view.key))
            .filter(|key| !current.contains_key(key))
            .collect();
        for key in removed {
            workers.remove(&key);
            if let Err(err) = self.reconciler.forget(&key).await {
                tracing::warn!(resource = %key, error = %err, "Failed to remove resource");
                if err.is_fatal() {
                    self.shutdown.trigger();
                    return;
                }
            }
        }

        for (key, resource) in current {
            let worker = workers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_worker(key.clone()));
            if worker.send(resource.clone()).is_err() {
                workers.remove(&key);
            }
        }
        tracing::debug!(resources = workers.len(), "Resources delivered");
    }

    fn spawn_worker(&self, key: ResourceKey) -> mpsc::UnboundedSender<RoutingResource> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_worker(reconciler, shutdown, rx).await;
            tracing::debug!(resource = %key, "Worker stopped");
        });
        tx
    }

    fn watch_manifests(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>), DriverError> {
        let dir = self.manifests.dir().to_path_buf();
        let watch_err = |source| DriverError::Watch {
            path: dir.display().to_string(),
            source,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let manifest = event.paths.iter().any(|path| {
                        matches!(
                            path.extension().and_then(|ext| ext.to_str()),
                            Some("yaml") | Some("yml")
                        )
                    });
                    if manifest && !event.kind.is_access() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Manifest watch error"),
            },
            Config::default().with_poll_interval(self.poll_interval),
        )
        .map_err(watch_err)?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(watch_err)?;

        tracing::info!(dir = %dir.display(), "Watching manifests");
        Ok((watcher, rx))
    }
}

/// Process snapshots for one resource until its channel closes or shutdown.
async fn run_worker(
    reconciler: Arc<Reconciler>,
    shutdown: Shutdown,
    mut snapshots: mpsc::UnboundedReceiver<RoutingResource>,
) {
    let mut stopped = shutdown.subscribe();
    let mut pending = None;

    loop {
        let mut resource = match pending.take() {
            Some(resource) => resource,
            None => tokio::select! {
                _ = stopped.recv() => break,
                next = snapshots.recv() => match next {
                    Some(resource) => resource,
                    None => break,
                },
            },
        };
        while let Ok(newer) = snapshots.try_recv() {
            resource = newer;
        }

        let action = match reconciler.reconcile(&resource).await {
            Ok(action) => action,
            Err(err) if err.is_fatal() => {
                shutdown.trigger();
                break;
            }
            Err(err) => reconciler.error_policy(&err),
        };

        if let Action::RequeueAfter(delay) = action {
            tokio::select! {
                _ = stopped.recv() => break,
                next = snapshots.recv() => match next {
                    Some(newer) => pending = Some(newer),
                    None => break,
                },
                _ = tokio::time::sleep(delay) => pending = Some(resource),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ServicePort;

    const SERVICE: &str = r#"
kind: Service
metadata:
  name: web
  namespace: ns
spec:
  ports:
    - port: 80
      targetPort: 8080
"#;

    #[tokio::test]
    async fn test_reload_swaps_store() {
        let dir = tempfile::tempdir().unwrap();
        let manifests = LiveManifests::load(dir.path()).unwrap();
        assert!(manifests.get_service("ns", "web").await.is_err());

        std::fs::write(dir.path().join("service.yaml"), SERVICE).unwrap();
        manifests.reload().unwrap();
        let service = manifests.get_service("ns", "web").await.unwrap();
        assert_eq!(service.ports, vec![ServicePort::new(80).targeting(8080)]);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("service.yaml"), SERVICE).unwrap();
        let manifests = LiveManifests::load(dir.path()).unwrap();

        std::fs::write(dir.path().join("broken.yaml"), "kind: [").unwrap();
        assert!(manifests.reload().is_err());
        assert!(manifests.get_service("ns", "web").await.is_ok());
    }
}
