//! Result fan-out
//!
//! The distributor reads each probe result once from the shared result queue
//! and clones it onto one bounded queue per sink. Every sink has its own
//! consumer task, so each sink sees results in production order.
//!
//! ```text
//!                            ┌────────────┐    ┌────────┐
//!                      ┌────▶│ sink queue │───▶│ sink 0 │
//! ┌──────────────┐     │     └────────────┘    └────────┘
//! │ result queue │──▶ distributor   ...
//! └──────────────┘     │     ┌────────────┐    ┌────────┐
//!                      └────▶│ sink queue │───▶│ sink N │
//!                            └────────────┘    └────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::ProbeResult;
use crate::sinks::ResultSink;

/// What a failed sink write does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkFailurePolicy {
    /// Log the failure and keep delivering
    #[default]
    Isolate,
    /// Stop distribution and report the failure
    Abort,
}

impl std::str::FromStr for SinkFailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "isolate" => Ok(Self::Isolate),
            "abort" => Ok(Self::Abort),
            other => Err(Error::config(format!(
                "unknown sink failure policy '{other}', expected isolate or abort"
            ))),
        }
    }
}

/// Delivery counts of one sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
}

/// Outcome of a distribution run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionReport {
    /// Results read from the result queue
    pub received: u64,
    /// Per-sink counts, in sink order
    pub sinks: Vec<SinkReport>,
}

impl DistributionReport {
    pub fn sink(&self, name: &str) -> Option<&SinkReport> {
        self.sinks.iter().find(|s| s.name == name)
    }

    pub fn total_delivered(&self) -> u64 {
        self.sinks.iter().map(|s| s.delivered).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.sinks.iter().map(|s| s.failed).sum()
    }
}

/// Running fan-out task
pub struct Distributor {
    handle: JoinHandle<Result<DistributionReport>>,
    aborted: CancellationToken,
}

impl Distributor {
    /// Start distributing `results` to `sinks`
    ///
    /// Each sink queue holds up to `capacity` results.
    pub fn spawn(
        results: mpsc::Receiver<ProbeResult>,
        sinks: Vec<Arc<dyn ResultSink>>,
        capacity: usize,
        policy: SinkFailurePolicy,
    ) -> Self {
        let aborted = CancellationToken::new();
        let handle = tokio::spawn(distribute(
            results,
            sinks,
            capacity.max(1),
            policy,
            aborted.clone(),
        ));
        Self { handle, aborted }
    }

    /// Cancelled as soon as a sink fails under [`SinkFailurePolicy::Abort`]
    pub fn aborted(&self) -> CancellationToken {
        self.aborted.clone()
    }

    /// Wait until the result queue is closed and every sink has drained
    pub async fn join(self) -> Result<DistributionReport> {
        self.handle
            .await
            .map_err(|e| Error::sink("distributor", format!("task failed: {e}")))?
    }
}

async fn consume(
    sink: Arc<dyn ResultSink>,
    mut rx: mpsc::Receiver<ProbeResult>,
    policy: SinkFailurePolicy,
    abort: CancellationToken,
) -> (SinkReport, Option<Error>) {
    let mut report = SinkReport {
        name: sink.name().to_string(),
        ..Default::default()
    };

    while let Some(result) = rx.recv().await {
        match sink.write(&result).await {
            Ok(()) => {
                report.delivered += 1;
                crate::metrics::record_sink_write(&report.name, None);
            }
            Err(e) => {
                report.failed += 1;
                crate::metrics::record_sink_write(&report.name, Some(e.category()));

                match policy {
                    SinkFailurePolicy::Isolate => {
                        tracing::warn!(
                            sink = %report.name,
                            host = %result.host,
                            error = %e,
                            "Sink write failed"
                        );
                    }
                    SinkFailurePolicy::Abort => {
                        tracing::error!(
                            sink = %report.name,
                            host = %result.host,
                            error = %e,
                            "Sink write failed, aborting distribution"
                        );
                        abort.cancel();
                        let err = match e {
                            Error::SinkWrite { .. } => e,
                            other => Error::sink(report.name.clone(), other),
                        };
                        return (report, Some(err));
                    }
                }
            }
        }
    }

    (report, None)
}

async fn distribute(
    mut results: mpsc::Receiver<ProbeResult>,
    sinks: Vec<Arc<dyn ResultSink>>,
    capacity: usize,
    policy: SinkFailurePolicy,
    abort: CancellationToken,
) -> Result<DistributionReport> {
    let mut senders = Vec::with_capacity(sinks.len());
    let mut consumers = Vec::with_capacity(sinks.len());

    for sink in sinks {
        let (tx, rx) = mpsc::channel(capacity);
        senders.push(tx);
        consumers.push(tokio::spawn(consume(sink, rx, policy, abort.clone())));
    }

    let mut report = DistributionReport::default();

    loop {
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => break,
            next = results.recv() => match next {
                Some(result) => result,
                None => break,
            },
        };
        report.received += 1;

        for tx in &senders {
            // A closed queue means its consumer aborted
            let _ = tx.send(result.clone()).await;
        }
    }

    drop(senders);
    drop(results);

    let mut first_error = None;
    for joined in futures::future::join_all(consumers).await {
        match joined {
            Ok((sink_report, error)) => {
                report.sinks.push(sink_report);
                if first_error.is_none() {
                    first_error = error;
                }
            }
            Err(e) => tracing::error!(error = %e, "Sink consumer panicked"),
        }
    }

    tracing::debug!(
        received = report.received,
        delivered = report.total_delivered(),
        failed = report.total_failed(),
        "Distribution finished"
    );

    match first_error {
        Some(err) => Err(err),
        None => Ok(report),
    }
}
