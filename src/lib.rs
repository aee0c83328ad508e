//! pingfleet - parallel host prober
//!
//! Probes a fleet of hosts with ICMP echo or TCP connect, and delivers loss
//! and latency of every host to any mix of console, file, HTTP API and SQL
//! database, once or on a fixed interval.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`targets`] - Host resolution and the target registry
//! - [`probe`] - Echo and TCP connect probe strategies
//! - [`pool`] - Worker pool running probes in parallel
//! - [`fanout`] - Multicast of results to every sink
//! - [`scheduler`] - One-shot and periodic run loop
//! - [`sources`] / [`sinks`] - Where hosts come from and results go
//! - [`remote`] - HTTP API and SQL clients with retry
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus counters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pingfleet::config::Config;
//! use pingfleet::probe::build_strategy;
//! use pingfleet::scheduler::Scheduler;
//! use pingfleet::sinks::StdoutSink;
//! use pingfleet::sources::ArgvSource;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let scheduler = Scheduler::builder()
//!         .config(&config)
//!         .strategy(build_strategy(&config.probe))
//!         .source(Arc::new(ArgvSource::new(["192.168.1.1", "example.com"])))
//!         .sink(Arc::new(StdoutSink))
//!         .build()?;
//!     scheduler.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fanout;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod probe;
pub mod remote;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod targets;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, ProbeMode};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::fanout::{DistributionReport, SinkFailurePolicy};
    pub use crate::models::{Host, ProbeResult, ProbeStatus};
    pub use crate::probe::ProbeStrategy;
    pub use crate::scheduler::{RunMode, RunSummary, Scheduler};
    pub use crate::sinks::ResultSink;
    pub use crate::targets::{HostResolver, HostSource, TargetRegistry};
}

// Direct re-exports for convenience
pub use models::{Host, ProbeResult, ProbeStatus};
