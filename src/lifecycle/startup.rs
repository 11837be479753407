//! Startup orchestration.
//!
//! # Responsibilities
//! - Install a bootstrap configuration when none exists
//! - Launch the proxy binary once
//! - Poll the process table until the proxy appears or the deadline passes
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - An already-running proxy is adopted instead of launched again

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::ProxyProcessConfig;
use crate::observability::metrics;
use crate::proxy::{ProcessError, ReloadError, ReloadSupervisor};
use crate::render::{RenderError, Renderer};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to render bootstrap configuration: {0}")]
    Render(#[from] RenderError),

    #[error("failed to install bootstrap configuration: {0}")]
    Bootstrap(#[from] ReloadError),

    #[error("failed to launch proxy: {0}")]
    Launch(#[from] ProcessError),

    #[error("proxy did not appear in the process table within {0:?}")]
    Timeout(Duration),
}

/// Brings the proxy up before the convergence loop starts.
#[derive(Debug, Clone)]
pub struct StartupSupervisor {
    timeout: Duration,
    poll_interval: Duration,
}

impl StartupSupervisor {
    pub fn new(config: &ProxyProcessConfig) -> Self {
        Self::with_timing(
            Duration::from_secs(config.startup_timeout_secs),
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn with_timing(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Bootstrap, launch and wait for the proxy.
    pub async fn start(
        &self,
        supervisor: &ReloadSupervisor,
        renderer: &Renderer,
    ) -> Result<(), StartupError> {
        let bootstrap = renderer.render_empty()?;
        if supervisor.bootstrap(&bootstrap).await? {
            tracing::info!("No configuration was installed; bootstrap written");
        }

        let process = supervisor.process();
        if process.is_running().await {
            tracing::info!("Proxy already running; adopting it");
            metrics::record_proxy_up(true);
            return Ok(());
        }

        process.launch().await?;
        self.wait_until_running(supervisor).await
    }

    /// Poll until the proxy is in the process table.
    pub async fn wait_until_running(&self, supervisor: &ReloadSupervisor) -> Result<(), StartupError> {
        let deadline = Instant::now() + self.timeout;
        let process = supervisor.process();
        loop {
            if process.is_running().await {
                metrics::record_proxy_up(true);
                tracing::info!("Proxy is running");
                return Ok(());
            }
            if Instant::now() >= deadline {
                metrics::record_proxy_up(false);
                tracing::error!(timeout = ?self.timeout, "Proxy failed to start");
                return Err(StartupError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
