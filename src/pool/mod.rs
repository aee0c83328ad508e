//! Worker pool running probes in parallel
//!
//! ```text
//!                    ┌──────────┐
//!              ┌────▶│ worker 0 │────┐
//! ┌──────────┐ │     └──────────┘    │     ┌──────────────┐
//! │ job queue│─┼────▶   ...       ───┼────▶│ result queue │
//! └──────────┘ │     ┌──────────┐    │     └──────────────┘
//!              └────▶│ worker W │────┘
//!                    └──────────┘
//! ```
//!
//! Workers share one receiver behind a mutex. They exit once the job queue is
//! closed and drained, or when the result queue has no reader left.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::models::{Host, ProbeResult, ProbeStatus};
use crate::probe::ProbeStrategy;

/// Job queue sized to the worker count
pub fn job_channel(workers: usize) -> (mpsc::Sender<Host>, mpsc::Receiver<Host>) {
    mpsc::channel(workers.max(1))
}

/// Result queue capacity for a pass over `hosts` hosts
pub fn result_capacity(hosts: usize, workers: usize) -> usize {
    hosts.max(2 * workers).max(1)
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Pool statistics (thread-safe)
#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    up: AtomicU64,
    down: AtomicU64,
    errors: AtomicU64,
}

impl PoolStats {
    fn record(&self, status: Option<ProbeStatus>) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            Some(ProbeStatus::Up) => &self.up,
            Some(ProbeStatus::Down) => &self.down,
            Some(ProbeStatus::Error) | None => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            up: self.up.load(Ordering::Relaxed),
            down: self.down.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub processed: u64,
    pub up: u64,
    pub down: u64,
    pub errors: u64,
}

// ============================================================================
// Pool
// ============================================================================

/// Running set of probe workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn `workers` tasks consuming `jobs` and producing into `results`
    pub fn spawn(
        workers: usize,
        strategy: Arc<dyn ProbeStrategy>,
        jobs: mpsc::Receiver<Host>,
        results: mpsc::Sender<ProbeResult>,
    ) -> Self {
        let workers = workers.max(1);
        let jobs = Arc::new(Mutex::new(jobs));
        let stats = Arc::new(PoolStats::default());
        let mut handles = Vec::with_capacity(workers);

        tracing::info!(workers, mode = strategy.mode(), "Starting worker pool");

        for worker_id in 0..workers {
            let jobs = Arc::clone(&jobs);
            let results = results.clone();
            let strategy = Arc::clone(&strategy);
            let stats = Arc::clone(&stats);

            let handle = tokio::spawn(async move {
                loop {
                    let host = {
                        let mut rx = jobs.lock().await;
                        rx.recv().await
                    };

                    let Some(host) = host else {
                        break; // Channel closed
                    };

                    tracing::debug!(worker_id, host = %host.socket_string(), "Probing");

                    let result = {
                        let _timer = crate::metrics::start_probe_timer(strategy.mode());
                        match strategy.probe(&host).await {
                            Ok(result) => result,
                            Err(e) => {
                                tracing::warn!(worker_id, host = %host, error = %e, "Probe failed");
                                ProbeResult::failed(host, e.to_string())
                            }
                        }
                    };

                    stats.record(result.status);
                    crate::metrics::record_probe(result.status);

                    if results.send(result).await.is_err() {
                        tracing::warn!(worker_id, "Result channel closed");
                        break;
                    }
                }

                tracing::debug!(worker_id, "Probe worker shutting down");
            });

            handles.push(handle);
        }

        Self { handles, stats }
    }

    /// Wait for every worker to exit
    pub async fn join(self) -> PoolSnapshot {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Probe worker panicked");
            }
        }

        let snapshot = self.stats.snapshot();
        tracing::debug!(
            processed = snapshot.processed,
            up = snapshot.up,
            down = snapshot.down,
            errors = snapshot.errors,
            "Worker pool stopped"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Recording {
        seen: std::sync::Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl ProbeStrategy for Recording {
        fn mode(&self) -> &'static str {
            "recording"
        }

        async fn probe(&self, host: &Host) -> Result<ProbeResult> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            *self
                .seen
                .lock()
                .unwrap()
                .entry(host.address.clone())
                .or_default() += 1;
            if host.port == "0" {
                return Err(Error::probe(&host.address, "wrong port number: 0"));
            }
            Ok(ProbeResult::new(host.clone(), 0.0, Some(Duration::from_millis(1))))
        }
    }

    #[test]
    fn test_result_capacity() {
        assert_eq!(result_capacity(10, 4), 10);
        assert_eq!(result_capacity(3, 4), 8);
        assert_eq!(result_capacity(0, 0), 1);
    }

    #[tokio::test]
    async fn test_every_host_processed_once() {
        let strategy = Arc::new(Recording {
            seen: std::sync::Mutex::new(HashMap::new()),
        });
        let (job_tx, job_rx) = job_channel(4);
        let (result_tx, mut result_rx) = mpsc::channel(result_capacity(10, 4));

        let pool = WorkerPool::spawn(4, strategy.clone(), job_rx, result_tx);

        for i in 0..10 {
            job_tx.send(Host::new(format!("10.0.0.{i}"), "80")).await.unwrap();
        }
        drop(job_tx);

        let snapshot = pool.join().await;
        assert_eq!(snapshot.processed, 10);

        let mut results = Vec::new();
        while let Some(r) = result_rx.recv().await {
            results.push(r);
        }
        assert_eq!(results.len(), 10);

        let seen = strategy.seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_probe_error_becomes_error_result() {
        let strategy = Arc::new(Recording {
            seen: std::sync::Mutex::new(HashMap::new()),
        });
        let (job_tx, job_rx) = job_channel(2);
        let (result_tx, mut result_rx) = mpsc::channel(4);
        let pool = WorkerPool::spawn(2, strategy, job_rx, result_tx);

        job_tx.send(Host::new("10.0.0.1", "0")).await.unwrap();
        job_tx.send(Host::new("10.0.0.2", "80")).await.unwrap();
        drop(job_tx);

        let snapshot = pool.join().await;
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.up, 1);

        let mut statuses = Vec::new();
        while let Some(r) = result_rx.recv().await {
            if r.status == Some(ProbeStatus::Error) {
                assert_eq!(r.loss, 100.0);
                assert!(r.output[0].contains("wrong port number"));
            }
            statuses.push(r.status);
        }
        assert_eq!(statuses.len(), 2);
    }
}
