//! Probe scheduling loop
//!
//! A run loads the target registry, feeds every host to the worker pool and
//! lets the fan-out distributor deliver results to the sinks.
//!
//! # Flow
//!
//! ```text
//! sources ──▶ TargetRegistry ──▶ job queue ──▶ WorkerPool ──▶ result queue ──▶ Distributor ──▶ sinks
//!                 ▲
//!                 └──────────── reload on every tick (periodic mode) ──────────────
//! ```
//!
//! In [`RunMode::Once`] the job queue is closed after the first pass. In
//! [`RunMode::Every`] the queue stays open and each tick reloads the registry
//! and enqueues the full host list again, until the cancellation token fires.
//! A reload that fails keeps the previous snapshot.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::{DistributionReport, Distributor, SinkFailurePolicy};
use crate::models::Host;
use crate::pool::{job_channel, result_capacity, PoolSnapshot, WorkerPool};
use crate::probe::ProbeStrategy;
use crate::remote::DbClient;
use crate::sinks::ResultSink;
use crate::targets::{HostResolver, HostSource, TargetRegistry};

/// One pass or repeat forever
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Once,
    Every(Duration),
}

impl RunMode {
    pub fn from_interval(every: Option<Duration>) -> Self {
        every.map_or(Self::Once, Self::Every)
    }
}

/// Resource released when a run ends
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self);
}

#[async_trait]
impl Cleanup for DbClient {
    async fn cleanup(&self) {
        self.close().await;
    }
}

/// What a run did
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Passes whose hosts were all enqueued
    pub passes: u64,
    /// Registry reloads attempted on ticks
    pub reloads: u64,
    /// Reloads that failed and kept the previous snapshot
    pub failed_reloads: u64,
    /// Hosts sent to the job queue
    pub enqueued: u64,
    pub pool: PoolSnapshot,
    pub distribution: DistributionReport,
}

/// Drives sources, workers and sinks
pub struct Scheduler {
    sources: Vec<Arc<dyn HostSource>>,
    sinks: Vec<Arc<dyn ResultSink>>,
    strategy: Arc<dyn ProbeStrategy>,
    resolver: HostResolver,
    workers: usize,
    mode: RunMode,
    policy: SinkFailurePolicy,
    cleanups: Vec<Arc<dyn Cleanup>>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Run until the single pass completes or, in periodic mode, until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let mut registry = match TargetRegistry::load(&self.sources, &self.resolver).await {
            Ok(registry) => registry,
            Err(e) => {
                self.cleanup().await;
                return Err(e);
            }
        };

        info!(
            hosts = registry.len(),
            workers = self.workers,
            mode = ?self.mode,
            "Starting probe run"
        );

        let capacity = result_capacity(registry.len(), self.workers);
        let (job_tx, job_rx) = job_channel(self.workers);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        let pool = WorkerPool::spawn(self.workers, Arc::clone(&self.strategy), job_rx, result_tx);
        let distributor = Distributor::spawn(result_rx, self.sinks.clone(), capacity, self.policy);
        let aborted = distributor.aborted();

        let mut summary = RunSummary::default();

        if enqueue(&job_tx, registry.hosts(), &cancel, &aborted, &mut summary).await {
            if let RunMode::Every(period) = self.mode {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = aborted.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    summary.reloads += 1;
                    match TargetRegistry::load(&self.sources, &self.resolver).await {
                        Ok(fresh) => {
                            debug!(hosts = fresh.len(), "Registry reloaded");
                            crate::metrics::record_reload(true);
                            registry = fresh;
                        }
                        Err(e) => {
                            warn!(error = %e, "Reload failed, keeping previous hosts");
                            crate::metrics::record_reload(false);
                            summary.failed_reloads += 1;
                        }
                    }

                    if !enqueue(&job_tx, registry.hosts(), &cancel, &aborted, &mut summary).await {
                        break;
                    }
                }
            }
        }

        drop(job_tx);
        summary.pool = pool.join().await;
        let distribution = distributor.join().await;

        self.cleanup().await;

        summary.distribution = distribution?;
        info!(
            passes = summary.passes,
            reloads = summary.reloads,
            probed = summary.pool.processed,
            delivered = summary.distribution.total_delivered(),
            failed = summary.distribution.total_failed(),
            "Probe run finished"
        );
        Ok(summary)
    }

    async fn cleanup(&self) {
        for cleanup in &self.cleanups {
            cleanup.cleanup().await;
        }
    }
}

/// Send every host to the pool; false when cancelled, aborted or the pool is gone
async fn enqueue(
    jobs: &mpsc::Sender<Host>,
    hosts: &[Host],
    cancel: &CancellationToken,
    aborted: &CancellationToken,
    summary: &mut RunSummary,
) -> bool {
    for host in hosts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = aborted.cancelled() => {
                warn!("Distribution aborted, stopping");
                return false;
            }
            sent = jobs.send(host.clone()) => {
                if sent.is_err() {
                    warn!("Job queue closed, stopping");
                    return false;
                }
            }
        }
        summary.enqueued += 1;
    }
    summary.passes += 1;
    true
}

/// Builder for [`Scheduler`]
#[derive(Default)]
pub struct SchedulerBuilder {
    sources: Vec<Arc<dyn HostSource>>,
    sinks: Vec<Arc<dyn ResultSink>>,
    strategy: Option<Arc<dyn ProbeStrategy>>,
    default_port: Option<u16>,
    workers: Option<usize>,
    mode: Option<RunMode>,
    policy: SinkFailurePolicy,
    cleanups: Vec<Arc<dyn Cleanup>>,
}

impl SchedulerBuilder {
    /// Take workers, port, mode and sink policy from configuration
    pub fn config(mut self, config: &Config) -> Self {
        self.workers = Some(config.pool.workers);
        self.default_port = Some(config.probe.default_port);
        self.mode = Some(RunMode::from_interval(config.schedule.every));
        self.policy = config.output.on_sink_error;
        self
    }

    pub fn source(mut self, source: Arc<dyn HostSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn ProbeStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn policy(mut self, policy: SinkFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cleanup(mut self, cleanup: Arc<dyn Cleanup>) -> Self {
        self.cleanups.push(cleanup);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let strategy = self
            .strategy
            .ok_or_else(|| Error::config("a probe strategy is required"))?;

        if self.sources.is_empty() {
            return Err(Error::config("no host sources configured"));
        }

        let workers = self.workers.unwrap_or(4);
        if workers == 0 {
            return Err(Error::config("workers must be greater than 0"));
        }

        Ok(Scheduler {
            sources: self.sources,
            sinks: self.sinks,
            strategy,
            resolver: HostResolver::new(self.default_port.unwrap_or(80)),
            workers,
            mode: self.mode.unwrap_or(RunMode::Once),
            policy: self.policy,
            cleanups: self.cleanups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProbeResult;
    use crate::sources::ArgvSource;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Instant0;

    #[async_trait]
    impl ProbeStrategy for Instant0 {
        fn mode(&self) -> &'static str {
            "instant"
        }

        async fn probe(&self, host: &Host) -> Result<ProbeResult> {
            Ok(ProbeResult::new(host.clone(), 0.0, Some(Duration::from_millis(1))))
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl ResultSink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn write(&self, result: &ProbeResult) -> Result<()> {
            self.0.lock().unwrap().push(result.host.address.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Closed(AtomicBool);

    #[async_trait]
    impl Cleanup for Closed {
        async fn cleanup(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Fails on every load after the first
    struct FlakySource(AtomicU32);

    #[async_trait]
    impl HostSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
            if self.0.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(Error::resolution("wp.pl/24"));
            }
            Ok(vec![resolver.host("10.0.0.9").await?])
        }
    }

    #[test]
    fn test_build_requires_strategy_and_source() {
        assert!(Scheduler::builder().build().is_err());
        assert!(Scheduler::builder()
            .strategy(Arc::new(Instant0))
            .build()
            .is_err());
        assert!(Scheduler::builder()
            .strategy(Arc::new(Instant0))
            .source(Arc::new(ArgvSource::new(["10.0.0.1"])))
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_one_shot_run_delivers_and_cleans_up() {
        let sink = Arc::new(Collect::default());
        let closed = Arc::new(Closed::default());
        let scheduler = Scheduler::builder()
            .strategy(Arc::new(Instant0))
            .source(Arc::new(ArgvSource::new(["10.0.0.1", "10.0.0.2", "10.0.0.3"])))
            .sink(sink.clone())
            .cleanup(closed.clone())
            .workers(2)
            .build()
            .unwrap();

        let summary = scheduler.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.passes, 1);
        assert_eq!(summary.enqueued, 3);
        assert_eq!(summary.pool.processed, 3);
        assert_eq!(summary.distribution.total_delivered(), 3);
        assert_eq!(sink.0.lock().unwrap().len(), 3);
        assert!(closed.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_initial_load_failure_aborts_run() {
        let closed = Arc::new(Closed::default());
        let scheduler = Scheduler::builder()
            .strategy(Arc::new(Instant0))
            .source(Arc::new(ArgvSource::new(["wp.pl/24"])))
            .cleanup(closed.clone())
            .build()
            .unwrap();

        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::HostResolution { .. }));
        assert!(closed.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let sink = Arc::new(Collect::default());
        let scheduler = Scheduler::builder()
            .strategy(Arc::new(Instant0))
            .source(Arc::new(FlakySource(AtomicU32::new(0))))
            .sink(sink.clone())
            .mode(RunMode::Every(Duration::from_millis(40)))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        let summary = scheduler.run(cancel).await.unwrap();

        assert!(summary.reloads >= 2);
        assert_eq!(summary.failed_reloads, summary.reloads);
        assert!(summary.passes >= summary.reloads);
        let seen = sink.0.lock().unwrap();
        assert!(seen.iter().all(|a| a == "10.0.0.9"));
        assert_eq!(seen.len() as u64, summary.passes);
    }
}
