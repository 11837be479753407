//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP requests a resync of every resource, not a shutdown

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Shutdown;

/// Spawn the signal listener.
///
/// SIGTERM and SIGINT trigger `shutdown`; SIGHUP sends on `resync`.
pub fn spawn(shutdown: Shutdown, resync: mpsc::UnboundedSender<()>) -> io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut stopped = shutdown.subscribe();

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    tracing::info!(signal = "SIGTERM", "Shutdown requested");
                    shutdown.trigger();
                    break;
                }
                _ = interrupt.recv() => {
                    tracing::info!(signal = "SIGINT", "Shutdown requested");
                    shutdown.trigger();
                    break;
                }
                _ = hangup.recv() => {
                    tracing::info!(signal = "SIGHUP", "Resync requested");
                    if resync.send(()).is_err() {
                        break;
                    }
                }
                _ = stopped.recv() => break,
            }
        }
    }))
}
