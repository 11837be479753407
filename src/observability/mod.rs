//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (logging.rs installs the subscriber)
//!     → counters and gauges (metrics.rs)
//!
//! Consumers:
//!     → stdout (pretty for development, JSON for log aggregation)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Every convergence pass runs in a span carrying a pass id
//! - Metric helpers are free functions; the recorder is global
//! - Without an installed recorder, metric calls are no-ops

pub mod logging;
pub mod metrics;
