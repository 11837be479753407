//! Proxy process control.
//!
//! # Responsibilities
//! - Run the binary's configuration-check mode against a file
//! - Deliver the reload signal to the pid recorded in the pid file
//! - Query the process table for a running proxy
//! - Launch the binary
//!
//! # Design Decisions
//! - `ProcessControl` is the seam tests replace with a mock
//! - The configuration test has a deadline; expiry counts as a failure
//! - Liveness is a process-table lookup by name, not a pid probe, so a
//!   stale pid file cannot mask a dead proxy

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::process::Command;

use crate::config::ProxyProcessConfig;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("configuration test failed: {0}")]
    TestFailed(String),

    #[error("configuration test did not finish within {0:?}")]
    TestTimeout(Duration),

    #[error("failed to execute {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read pid file {path}: {source}")]
    PidFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("pid file contains {0:?}, not a process id")]
    InvalidPid(String),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

/// Operations the supervisors need from the proxy process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Check a configuration file without applying it.
    async fn test_config(&self, path: &Path) -> Result<(), ProcessError>;

    /// Ask the running proxy to reload its configuration.
    async fn signal_reload(&self) -> Result<(), ProcessError>;

    /// Whether the proxy appears in the process table.
    async fn is_running(&self) -> bool;

    /// Start the proxy against the installed configuration.
    async fn launch(&self) -> Result<(), ProcessError>;
}

/// nginx, driven through its CLI, pid file and signals.
#[derive(Debug, Clone)]
pub struct NginxProcess {
    binary: PathBuf,
    process_name: String,
    pid_file: PathBuf,
    config_file: PathBuf,
    test_timeout: Duration,
}

impl NginxProcess {
    pub fn new(config: &ProxyProcessConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            process_name: config.process_name.clone(),
            pid_file: config.pid_file.clone(),
            config_file: config.config_file.clone(),
            test_timeout: Duration::from_secs(config.test_timeout_secs),
        }
    }

    fn spawn_error(&self, source: io::Error) -> ProcessError {
        ProcessError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        }
    }

    async fn read_pid(&self) -> Result<i32, ProcessError> {
        let content = tokio::fs::read_to_string(&self.pid_file)
            .await
            .map_err(|source| ProcessError::PidFile {
                path: self.pid_file.display().to_string(),
                source,
            })?;
        parse_pid(&content)
    }
}

/// Parse the content of a pid file.
pub fn parse_pid(content: &str) -> Result<i32, ProcessError> {
    let trimmed = content.trim();
    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ProcessError::InvalidPid(trimmed.to_string())),
    }
}

/// Whether any process in the table is called `name`.
pub fn process_running(name: &str) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let wanted = OsStr::new(name);
    system.processes().values().any(|process| process.name() == wanted)
}

#[async_trait]
impl ProcessControl for NginxProcess {
    async fn test_config(&self, path: &Path) -> Result<(), ProcessError> {
        let output = Command::new(&self.binary)
            .arg("-t")
            .arg("-c")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.test_timeout, output)
            .await
            .map_err(|_| ProcessError::TestTimeout(self.test_timeout))?
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(file = %path.display(), status = %output.status, stderr = %stderr, "Configuration test failed");
            Err(ProcessError::TestFailed(stderr))
        }
    }

    async fn signal_reload(&self) -> Result<(), ProcessError> {
        let pid = self.read_pid().await?;
        kill(Pid::from_raw(pid), Signal::SIGHUP)
            .map_err(|source| ProcessError::Signal { pid, source })?;
        tracing::debug!(pid, "Reload signal delivered");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let name = self.process_name.clone();
        tokio::task::spawn_blocking(move || process_running(&name))
            .await
            .unwrap_or(false)
    }

    async fn launch(&self) -> Result<(), ProcessError> {
        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_file)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        tracing::info!(binary = %self.binary.display(), config = %self.config_file.display(), "Proxy launched");

        // The master daemonizes; reap the foreground parent.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!(status = %status, "Proxy launcher exited abnormally"),
                Err(e) => tracing::warn!(error = %e, "Failed to wait for proxy launcher"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(binary: &str, dir: &Path) -> ProxyProcessConfig {
        ProxyProcessConfig {
            binary: binary.into(),
            pid_file: dir.join("nginx.pid"),
            config_file: dir.join("nginx.conf"),
            test_timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\n").unwrap(), 1234);
        assert!(matches!(parse_pid(""), Err(ProcessError::InvalidPid(_))));
        assert!(matches!(parse_pid("-1"), Err(ProcessError::InvalidPid(_))));
        assert!(matches!(parse_pid("abc"), Err(ProcessError::InvalidPid(_))));
    }

    #[tokio::test]
    async fn test_config_check_uses_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let passing = NginxProcess::new(&config("true", dir.path()));
        assert!(passing.test_config(&dir.path().join("x.conf")).await.is_ok());

        let failing = NginxProcess::new(&config("false", dir.path()));
        assert!(matches!(
            failing.test_config(&dir.path().join("x.conf")).await,
            Err(ProcessError::TestFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let process = NginxProcess::new(&config("/nonexistent/nginx", dir.path()));
        assert!(matches!(
            process.test_config(&dir.path().join("x.conf")).await,
            Err(ProcessError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let process = NginxProcess::new(&config("true", dir.path()));
        assert!(matches!(
            process.signal_reload().await,
            Err(ProcessError::PidFile { .. })
        ));
    }

    #[test]
    fn test_unknown_process_is_not_running() {
        assert!(!process_running("definitely-not-a-real-process-name"));
    }
}
