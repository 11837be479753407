//! Change-watch loop for TLS rotation and out-of-band edits.
//!
//! # Data Flow
//! ```text
//! notify (TLS dir, recursive; installed file's dir, non-recursive)
//!     → classify: TLS material | installed file | ignored
//!     → debounce window
//!     → ReloadSupervisor::revalidate() (test, signal, liveness on the on-disk file)
//! ```
//!
//! # Design Decisions
//! - The notify callback runs on its own thread and only forwards paths
//! - Writes the supervisor makes itself are filtered by fingerprint, so a
//!   commit does not trigger a second reload

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::WatchConfig;
use crate::observability::metrics;
use crate::proxy::files;
use crate::proxy::reload::{ApplyOutcome, ConfigPaths, ReloadError, ReloadSupervisor};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Reload(#[from] ReloadError),
}

/// What a filesystem event touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    TlsMaterial,
    InstalledConfig,
}

/// Watches the TLS directory and the installed configuration.
#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    paths: ConfigPaths,
    tls_dir: PathBuf,
    debounce: Duration,
    poll_interval: Duration,
}

impl ChangeWatcher {
    pub fn new(paths: ConfigPaths, tls_dir: impl Into<PathBuf>, config: &WatchConfig) -> Self {
        Self {
            paths,
            tls_dir: tls_dir.into(),
            debounce: Duration::from_millis(config.debounce_ms),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Decide whether an event path matters.
    pub fn classify(&self, path: &Path) -> Option<ChangeKind> {
        if self.paths.is_side_file(path) {
            return None;
        }
        if path.starts_with(&self.tls_dir) {
            let temp = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(files::TEMP_SUFFIX));
            return (!temp).then_some(ChangeKind::TlsMaterial);
        }
        (path == self.paths.installed).then_some(ChangeKind::InstalledConfig)
    }

    /// Register the notify watches. Paths are forwarded on the returned channel.
    ///
    /// The returned watcher must be kept alive for events to flow.
    pub fn start(
        &self,
    ) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>), WatchError> {
        std::fs::create_dir_all(&self.tls_dir).map_err(|source| WatchError::Io {
            path: self.tls_dir.display().to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(self.poll_interval),
        )
        .map_err(|source| WatchError::Notify {
            path: self.tls_dir.display().to_string(),
            source,
        })?;

        let config_dir = self
            .paths
            .installed
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        for (path, mode) in [
            (&self.tls_dir, RecursiveMode::Recursive),
            (&config_dir, RecursiveMode::NonRecursive),
        ] {
            watcher
                .watch(path, mode)
                .map_err(|source| WatchError::Notify {
                    path: path.display().to_string(),
                    source,
                })?;
        }

        tracing::info!(tls_dir = %self.tls_dir.display(), config = %self.paths.installed.display(), "Change watcher started");
        Ok((watcher, rx))
    }

    /// Watch until shutdown or a fatal reload failure.
    pub async fn run(
        self,
        supervisor: Arc<ReloadSupervisor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), WatchError> {
        let (_watcher, mut events) = self.start()?;

        loop {
            let first = tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(path) => path,
                    None => break,
                },
            };

            let mut changed: BTreeSet<ChangeKind> = self.classify(&first).into_iter().collect();
            let window = tokio::time::sleep(self.debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    event = events.recv() => match event {
                        Some(path) => changed.extend(self.classify(&path)),
                        None => break,
                    },
                }
            }

            if self.should_revalidate(&changed, &supervisor).await {
                self.revalidate(&supervisor, &changed).await?;
            }
        }

        tracing::info!("Change watcher stopped");
        Ok(())
    }

    async fn should_revalidate(
        &self,
        changed: &BTreeSet<ChangeKind>,
        supervisor: &ReloadSupervisor,
    ) -> bool {
        if changed.contains(&ChangeKind::TlsMaterial) {
            return true;
        }
        if !changed.contains(&ChangeKind::InstalledConfig) {
            return false;
        }
        match files::fingerprint_file(&self.paths.installed).await {
            Ok(Some(on_disk)) => supervisor.installed_fingerprint().await != Some(on_disk),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to hash installed configuration");
                false
            }
        }
    }

    async fn revalidate(
        &self,
        supervisor: &ReloadSupervisor,
        changed: &BTreeSet<ChangeKind>,
    ) -> Result<(), WatchError> {
        tracing::info!(changes = ?changed, "Filesystem change detected, revalidating configuration");
        match supervisor.revalidate().await {
            Ok(ApplyOutcome::Committed(fingerprint)) => {
                metrics::record_watch_reload("committed");
                tracing::info!(fingerprint = %fingerprint.short(), "Proxy reloaded after filesystem change");
                Ok(())
            }
            Ok(ApplyOutcome::Unchanged) => Ok(()),
            Err(err) if err.is_fatal() => {
                metrics::record_watch_reload("fatal");
                Err(err.into())
            }
            Err(err) => {
                metrics::record_watch_reload("failed");
                tracing::warn!(error = %err, "Revalidation failed; keeping current proxy state");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watcher() -> ChangeWatcher {
        let paths = ConfigPaths {
            installed: "/etc/nginx/nginx.conf".into(),
            test: "/etc/nginx/nginx.conf.test".into(),
            backup: "/etc/nginx/nginx.conf.bak".into(),
        };
        ChangeWatcher::new(paths, "/etc/nginx/ssl", &WatchConfig::default())
    }

    #[test]
    fn test_classify() {
        let watcher = watcher();
        assert_eq!(
            watcher.classify(Path::new("/etc/nginx/ssl/ns-site.crt")),
            Some(ChangeKind::TlsMaterial)
        );
        assert_eq!(
            watcher.classify(Path::new("/etc/nginx/nginx.conf")),
            Some(ChangeKind::InstalledConfig)
        );
        assert_eq!(watcher.classify(Path::new("/etc/nginx/nginx.conf.test")), None);
        assert_eq!(watcher.classify(Path::new("/etc/nginx/nginx.conf.bak")), None);
        assert_eq!(watcher.classify(Path::new("/etc/nginx/.nginx.conf.tmp")), None);
        assert_eq!(watcher.classify(Path::new("/etc/nginx/ssl/.ns-site.crt.tmp")), None);
        assert_eq!(watcher.classify(Path::new("/etc/nginx/mime.types")), None);
    }
}
