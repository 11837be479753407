//! Proxy process supervision.
//!
//! # Data Flow
//! ```text
//! RenderedConfiguration
//!     → reload.rs (fingerprint check, test, install, signal, liveness, rollback)
//!     → process.rs (nginx -t, SIGHUP via pid file, process-table lookup)
//!
//! Filesystem (TLS dir, installed file)
//!     → watcher.rs (notify, debounce) → ReloadSupervisor::revalidate
//! ```
//!
//! # Design Decisions
//! - Every write goes through files.rs: temp file, then rename
//! - Side files (test, backup, temp) never trigger the watcher

pub mod files;
pub mod process;
pub mod reload;
pub mod watcher;

pub use process::{NginxProcess, ProcessControl, ProcessError};
pub use reload::{ApplyOutcome, ApplyState, ConfigPaths, ReloadError, ReloadSupervisor};
pub use watcher::{ChangeWatcher, WatchError};
