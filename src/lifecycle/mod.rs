//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Bootstrap config (if none installed) → Launch proxy → Poll process table
//!     → hand off to the change-watch loop and the convergence driver
//!
//! Shutdown (shutdown.rs):
//!     Signal received | fatal supervisor error → broadcast → tasks stop
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//!     SIGHUP → Reload manifests and re-deliver every routing resource
//! ```
//!
//! # Design Decisions
//! - Startup failure is fatal; the controller never runs without a proxy
//! - The proxy process is not stopped on shutdown; it keeps serving the
//!   last committed configuration

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{StartupError, StartupSupervisor};
