//! End-to-end tests of the probe pipeline: scheduler, worker pool and fan-out

mod common;

use common::{addresses, CountingProbe, CountingSource, RecordingSink};
use pingfleet::error::Error;
use pingfleet::fanout::SinkFailurePolicy;
use pingfleet::scheduler::{RunMode, Scheduler};
use pingfleet::sinks::ResultSink;
use pingfleet::sources::ArgvSource;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_two_hosts_reach_every_sink_in_order() {
    let sinks: Vec<Arc<RecordingSink>> = (0..3)
        .map(|i| Arc::new(RecordingSink::new(&format!("sink-{i}"))))
        .collect();

    let mut builder = Scheduler::builder()
        .strategy(Arc::new(CountingProbe::default()))
        .source(Arc::new(ArgvSource::new(["10.0.0.1", "10.0.0.2"])))
        .workers(1);
    for sink in &sinks {
        builder = builder.sink(Arc::clone(sink) as Arc<dyn ResultSink>);
    }

    let summary = builder
        .build()
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.distribution.received, 2);
    assert_eq!(summary.distribution.total_delivered(), 6);
    for sink in &sinks {
        assert_eq!(sink.seen(), vec!["10.0.0.1", "10.0.0.2"]);
    }
}

#[tokio::test]
async fn test_four_workers_process_ten_hosts_once() {
    let hosts = addresses(10);
    let probe = Arc::new(CountingProbe::default());
    let sink = Arc::new(RecordingSink::new("collect"));

    let scheduler = Scheduler::builder()
        .strategy(probe.clone())
        .source(Arc::new(ArgvSource::new(hosts.clone())))
        .sink(sink.clone())
        .workers(4)
        .build()
        .unwrap();

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.pool.processed, 10);
    assert_eq!(summary.enqueued, 10);

    let mut calls = probe.calls();
    calls.sort();
    let mut expected = hosts.clone();
    expected.sort();
    assert_eq!(calls, expected);

    let mut seen = sink.seen();
    seen.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_periodic_run_reloads_and_reenqueues() {
    let period = Duration::from_millis(100);
    let source = Arc::new(CountingSource::new(&["10.0.0.1", "10.0.0.2"]));
    let sink = Arc::new(RecordingSink::new("collect"));

    let scheduler = Scheduler::builder()
        .strategy(Arc::new(CountingProbe::default()))
        .source(source.clone())
        .sink(sink.clone())
        .workers(2)
        .mode(RunMode::Every(period))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(period * 3 + period / 2).await;
        stopper.cancel();
    });

    let summary = scheduler.run(cancel).await.unwrap();

    assert!(summary.reloads >= 3, "reloads: {}", summary.reloads);
    assert_eq!(summary.failed_reloads, 0);
    assert_eq!(source.loads() as u64, summary.reloads + 1);
    assert!(summary.passes >= summary.reloads, "passes: {}", summary.passes);
    assert!(summary.enqueued >= summary.passes * 2);
    assert_eq!(sink.seen().len() as u64, summary.enqueued);
}

#[tokio::test]
async fn test_isolated_sink_failure_does_not_stop_others() {
    let good = Arc::new(RecordingSink::new("good"));
    let bad = Arc::new(RecordingSink::failing("bad"));

    let scheduler = Scheduler::builder()
        .strategy(Arc::new(CountingProbe::default()))
        .source(Arc::new(ArgvSource::new(["10.0.0.1", "10.0.0.2", "10.0.0.3"])))
        .sink(good.clone())
        .sink(bad.clone())
        .policy(SinkFailurePolicy::Isolate)
        .build()
        .unwrap();

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(good.seen().len(), 3);
    let bad_report = summary.distribution.sink("bad").unwrap();
    assert_eq!(bad_report.failed, 3);
    assert_eq!(bad_report.delivered, 0);
}

#[tokio::test]
async fn test_abort_policy_fails_the_run() {
    let scheduler = Scheduler::builder()
        .strategy(Arc::new(CountingProbe::default()))
        .source(Arc::new(ArgvSource::new(addresses(20))))
        .sink(Arc::new(RecordingSink::failing("bad")))
        .policy(SinkFailurePolicy::Abort)
        .workers(2)
        .build()
        .unwrap();

    let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::SinkWrite { .. }));
}

#[tokio::test]
async fn test_probe_errors_still_produce_results() {
    let sink = Arc::new(RecordingSink::new("collect"));
    let scheduler = Scheduler::builder()
        .strategy(Arc::new(pingfleet::probe::TcpConnectProbe::new(
            Duration::from_millis(200),
        )))
        .source(Arc::new(ArgvSource::new(["127.0.0.1:0", "127.0.0.2:0"])))
        .sink(sink.clone())
        .build()
        .unwrap();

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.pool.errors, 2);
    assert_eq!(sink.seen().len(), 2);
}

#[tokio::test]
async fn test_tcp_probe_against_local_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let sink = Arc::new(RecordingSink::new("collect"));
    let scheduler = Scheduler::builder()
        .strategy(Arc::new(pingfleet::probe::TcpConnectProbe::new(
            Duration::from_secs(2),
        )))
        .source(Arc::new(ArgvSource::new([format!("127.0.0.1:{port}")])))
        .sink(sink.clone())
        .build()
        .unwrap();

    let summary = scheduler.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.pool.up, 1);
    assert_eq!(sink.seen(), vec!["127.0.0.1"]);
}

#[tokio::test]
async fn test_abort_stops_periodic_run_before_next_tick() {
    let period = Duration::from_secs(5);
    let probe = Arc::new(CountingProbe::default());
    let scheduler = Scheduler::builder()
        .strategy(probe.clone())
        .source(Arc::new(ArgvSource::new(["10.0.0.1", "10.0.0.2"])))
        .sink(Arc::new(RecordingSink::failing("bad")))
        .policy(SinkFailurePolicy::Abort)
        .mode(RunMode::Every(period))
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(period / 2, scheduler.run(CancellationToken::new()))
        .await
        .expect("run should end on the first sink failure");

    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::SinkWrite { ref sink, .. } if sink == "bad"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(probe.calls().len() <= 2);
}
