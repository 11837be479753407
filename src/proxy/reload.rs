//! Safe apply/reload protocol.
//!
//! # Responsibilities
//! - Skip work when the candidate matches the installed fingerprint
//! - Test the candidate in a side file before touching the installed file
//! - Back up, atomically replace, verify, signal and check liveness
//! - Roll back on signal or liveness failure; halt when the proxy is gone
//!
//! # State Machine
//! ```text
//! Unchanged ─(fingerprint differs)→ Testing ─(test ok)→ Verified → Applied
//!     Testing ─(test fails)→ Failed        (side file removed, installed untouched)
//!     Verified ─(replace/verify fails)→ Failed (installed restored)
//!     Applied ─(signal ok, running)→ Committed
//!     Applied ─(signal fails | not running)→ RolledBack (backup restored, no re-signal)
//!     RolledBack ─(still not running)→ ProxyDown (fatal, supervisor halts)
//! ```
//!
//! # Design Decisions
//! - One `tokio::sync::Mutex` serializes every attempt; the proxy is a singleton
//! - Callers that need to compose a document from shared state take the lock
//!   first (`lock()`), then render, then apply under the same guard

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::ProxyProcessConfig;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::proxy::files;
use crate::proxy::process::{ProcessControl, ProcessError};
use crate::render::{Fingerprint, RenderedConfiguration};

/// Phases of one apply attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Unchanged,
    Testing,
    Verified,
    Applied,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApplyState::Unchanged => "unchanged",
            ApplyState::Testing => "testing",
            ApplyState::Verified => "verified",
            ApplyState::Applied => "applied",
            ApplyState::Committed => "committed",
            ApplyState::RolledBack => "rolled_back",
            ApplyState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Identical to the installed configuration; nothing written or signalled.
    Unchanged,
    /// Installed and reloaded.
    Committed(Fingerprint),
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("configuration test failed: {0}")]
    ConfigTest(#[source] ProcessError),

    #[error("failed to {step}: {source}")]
    Apply {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("reload failed, previous configuration restored: {reason}")]
    RolledBack { reason: String },

    #[error("proxy is not running after rollback: {reason}")]
    ProxyDown { reason: String },

    #[error("reload supervisor halted after a fatal proxy failure")]
    Halted,
}

impl ReloadError {
    /// Whether operator intervention is required.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReloadError::ProxyDown { .. } | ReloadError::Halted)
    }

    fn apply(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| ReloadError::Apply { step, source }
    }
}

/// Installed file and its side files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub installed: PathBuf,
    pub test: PathBuf,
    pub backup: PathBuf,
}

impl ConfigPaths {
    pub fn new(config: &ProxyProcessConfig) -> Self {
        Self {
            installed: config.config_file.clone(),
            test: config.test_file(),
            backup: config.backup_file(),
        }
    }

    /// Side, backup or temporary file owned by the supervisor.
    pub fn is_side_file(&self, path: &Path) -> bool {
        path == self.test
            || path == self.backup
            || path == files::temp_path(&self.installed)
            || path == files::temp_path(&self.test)
            || path == files::temp_path(&self.backup)
    }
}

#[derive(Debug, Default)]
struct Installed {
    fingerprint: Option<Fingerprint>,
}

/// Owns the installed configuration file of one proxy instance.
pub struct ReloadSupervisor {
    paths: ConfigPaths,
    process: Arc<dyn ProcessControl>,
    installed: Mutex<Installed>,
    halted: AtomicBool,
    shutdown: Option<Shutdown>,
}

impl ReloadSupervisor {
    pub fn new(paths: ConfigPaths, process: Arc<dyn ProcessControl>) -> Self {
        Self {
            paths,
            process,
            installed: Mutex::new(Installed::default()),
            halted: AtomicBool::new(false),
            shutdown: None,
        }
    }

    /// Trigger `shutdown` when the supervisor halts.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn process(&self) -> &Arc<dyn ProcessControl> {
        &self.process
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Fingerprint recorded for the installed file.
    pub async fn installed_fingerprint(&self) -> Option<Fingerprint> {
        self.installed.lock().await.fingerprint
    }

    /// Take the exclusive apply lock.
    pub async fn lock(&self) -> ApplyGuard<'_> {
        ApplyGuard {
            supervisor: self,
            installed: self.installed.lock().await,
        }
    }

    /// Apply a candidate under the lock.
    pub async fn apply(&self, candidate: &RenderedConfiguration) -> Result<ApplyOutcome, ReloadError> {
        self.lock().await.apply(candidate).await
    }

    /// Install `candidate` if no configuration exists yet. Does not signal.
    pub async fn bootstrap(&self, candidate: &RenderedConfiguration) -> Result<bool, ReloadError> {
        let mut installed = self.installed.lock().await;
        if let Some(existing) = files::fingerprint_file(&self.paths.installed)
            .await
            .map_err(ReloadError::apply("read installed configuration"))?
        {
            installed.fingerprint = Some(existing);
            return Ok(false);
        }

        let candidate = Candidate::from(candidate);
        self.test_candidate(&candidate).await?;
        files::write_atomic(&self.paths.installed, candidate.bytes)
            .await
            .map_err(ReloadError::apply("install bootstrap configuration"))?;
        discard(&self.paths.test).await;
        installed.fingerprint = Some(candidate.fingerprint);
        tracing::info!(path = %self.paths.installed.display(), fingerprint = %candidate.fingerprint.short(), "Bootstrap configuration installed");
        Ok(true)
    }

    /// Re-test the on-disk configuration and reload the proxy with it.
    ///
    /// The installed bytes are carried through unchanged, whatever their
    /// encoding.
    pub async fn revalidate(&self) -> Result<ApplyOutcome, ReloadError> {
        let mut guard = self.lock().await;
        let contents = tokio::fs::read(&self.paths.installed)
            .await
            .map_err(ReloadError::apply("read installed configuration"))?;
        guard.run(&Candidate::of(&contents)).await
    }

    async fn test_candidate(&self, candidate: &Candidate<'_>) -> Result<(), ReloadError> {
        transition(ApplyState::Testing, candidate);
        files::write_atomic(&self.paths.test, candidate.bytes)
            .await
            .map_err(ReloadError::apply("write test configuration"))?;

        if let Err(err) = self.process.test_config(&self.paths.test).await {
            discard(&self.paths.test).await;
            transition(ApplyState::Failed, candidate);
            metrics::record_reload("test_failed");
            return Err(ReloadError::ConfigTest(err));
        }
        Ok(())
    }

    fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(reason = %reason, "Proxy is down after rollback; halting, operator intervention required");
            if let Some(shutdown) = &self.shutdown {
                shutdown.trigger();
            }
        }
    }
}

impl fmt::Debug for ReloadSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadSupervisor")
            .field("paths", &self.paths)
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

/// Document bytes moving through one attempt.
struct Candidate<'a> {
    bytes: &'a [u8],
    fingerprint: Fingerprint,
}

impl<'a> Candidate<'a> {
    fn of(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            fingerprint: Fingerprint::of(bytes),
        }
    }
}

impl<'a> From<&'a RenderedConfiguration> for Candidate<'a> {
    fn from(rendered: &'a RenderedConfiguration) -> Self {
        Self {
            bytes: rendered.text.as_bytes(),
            fingerprint: rendered.fingerprint,
        }
    }
}

/// Exclusive access to the installed configuration.
pub struct ApplyGuard<'a> {
    supervisor: &'a ReloadSupervisor,
    installed: MutexGuard<'a, Installed>,
}

impl ApplyGuard<'_> {
    /// Run the full protocol for a candidate.
    pub async fn apply(&mut self, candidate: &RenderedConfiguration) -> Result<ApplyOutcome, ReloadError> {
        if self.supervisor.is_halted() {
            return Err(ReloadError::Halted);
        }
        let candidate = Candidate::from(candidate);

        let current = match self.installed.fingerprint {
            Some(fingerprint) => Some(fingerprint),
            None => files::fingerprint_file(&self.supervisor.paths.installed)
                .await
                .map_err(ReloadError::apply("read installed configuration"))?,
        };
        self.installed.fingerprint = current;

        if current == Some(candidate.fingerprint) {
            transition(ApplyState::Unchanged, &candidate);
            metrics::record_reload("unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        self.run(&candidate).await
    }

    /// Testing through Committed / RolledBack, without the fingerprint shortcut.
    async fn run(&mut self, candidate: &Candidate<'_>) -> Result<ApplyOutcome, ReloadError> {
        let supervisor = self.supervisor;
        if supervisor.is_halted() {
            return Err(ReloadError::Halted);
        }
        let paths = &supervisor.paths;

        supervisor.test_candidate(candidate).await?;
        transition(ApplyState::Verified, candidate);

        let previous = match self.install(candidate).await {
            Ok(previous) => previous,
            Err(err) => {
                discard(&paths.test).await;
                transition(ApplyState::Failed, candidate);
                metrics::record_reload("apply_failed");
                return Err(err);
            }
        };
        transition(ApplyState::Applied, candidate);

        let failure = match supervisor.process.signal_reload().await {
            Err(err) => Some(format!("reload signal failed: {}", err)),
            Ok(()) if !supervisor.process.is_running().await => {
                Some("proxy is not running after reload".to_string())
            }
            Ok(()) => None,
        };

        match failure {
            None => {
                discard(&paths.test).await;
                discard(&paths.backup).await;
                self.installed.fingerprint = Some(candidate.fingerprint);
                transition(ApplyState::Committed, candidate);
                metrics::record_reload("committed");
                metrics::record_proxy_up(true);
                tracing::info!(fingerprint = %candidate.fingerprint.short(), "Configuration committed");
                Ok(ApplyOutcome::Committed(candidate.fingerprint))
            }
            Some(reason) => self.roll_back(candidate, previous, reason).await,
        }
    }

    /// Back up, replace and verify. Returns the previous content.
    async fn install(&self, candidate: &Candidate<'_>) -> Result<Option<Vec<u8>>, ReloadError> {
        let paths = &self.supervisor.paths;
        let previous = files::read_if_exists(&paths.installed)
            .await
            .map_err(ReloadError::apply("read installed configuration"))?;
        if let Some(previous) = &previous {
            files::write_atomic(&paths.backup, previous)
                .await
                .map_err(ReloadError::apply("back up installed configuration"))?;
        }

        let replaced = async {
            files::write_atomic(&paths.installed, candidate.bytes)
                .await
                .map_err(ReloadError::apply("replace installed configuration"))?;
            match files::fingerprint_file(&paths.installed).await {
                Ok(Some(written)) if written == candidate.fingerprint => Ok(()),
                Ok(_) => Err(ReloadError::Apply {
                    step: "verify installed configuration",
                    source: io::Error::new(io::ErrorKind::InvalidData, "fingerprint mismatch after write"),
                }),
                Err(source) => Err(ReloadError::Apply {
                    step: "verify installed configuration",
                    source,
                }),
            }
        }
        .await;

        if let Err(err) = replaced {
            if let Err(restore) = restore(&paths.installed, previous.as_deref()).await {
                tracing::error!(error = %restore, "Failed to restore installed configuration");
            }
            return Err(err);
        }
        Ok(previous)
    }

    async fn roll_back(
        &mut self,
        candidate: &Candidate<'_>,
        previous: Option<Vec<u8>>,
        reason: String,
    ) -> Result<ApplyOutcome, ReloadError> {
        let supervisor = self.supervisor;
        let paths = &supervisor.paths;

        if let Err(err) = restore(&paths.installed, previous.as_deref()).await {
            tracing::error!(error = %err, "Failed to restore installed configuration from backup");
        }
        discard(&paths.test).await;
        discard(&paths.backup).await;
        self.installed.fingerprint = previous.as_deref().map(Fingerprint::of);
        transition(ApplyState::RolledBack, candidate);

        let running = supervisor.process.is_running().await;
        metrics::record_proxy_up(running);
        if running {
            metrics::record_reload("rolled_back");
            tracing::error!(reason = %reason, fingerprint = %candidate.fingerprint.short(), "Reload rolled back");
            Err(ReloadError::RolledBack { reason })
        } else {
            metrics::record_reload("proxy_down");
            supervisor.halt(&reason);
            Err(ReloadError::ProxyDown { reason })
        }
    }
}

async fn restore(installed: &Path, previous: Option<&[u8]>) -> io::Result<()> {
    match previous {
        Some(previous) => files::write_atomic(installed, previous).await,
        None => files::remove_if_exists(installed).await,
    }
}

/// Remove a side file. Failure leaves a stale file behind but does not fail the attempt.
async fn discard(path: &Path) {
    if let Err(err) = files::remove_if_exists(path).await {
        tracing::warn!(path = %path.display(), error = %err, "Failed to remove side file");
    }
}

fn transition(state: ApplyState, candidate: &Candidate<'_>) {
    tracing::debug!(state = %state, fingerprint = %candidate.fingerprint.short(), "Apply state");
}
