//! Common test utilities

use async_trait::async_trait;
use pingfleet::error::{Error, Result};
use pingfleet::probe::ProbeStrategy;
use pingfleet::sinks::ResultSink;
use pingfleet::targets::{HostResolver, HostSource};
use pingfleet::{Host, ProbeResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Probe that answers immediately, counting calls per address
#[derive(Default)]
pub struct CountingProbe {
    calls: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl CountingProbe {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProbeStrategy for CountingProbe {
    fn mode(&self) -> &'static str {
        "counting"
    }

    async fn probe(&self, host: &Host) -> Result<ProbeResult> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.calls.lock().unwrap().push(host.address.clone());
        Ok(ProbeResult::new(host.clone(), 0.0, Some(Duration::from_millis(1)))
            .with_output([format!("probed {}", host.address)]))
    }
}

/// Sink keeping the addresses it received, optionally failing every write
pub struct RecordingSink {
    name: String,
    fail: bool,
    seen: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, result: &ProbeResult) -> Result<()> {
        if self.fail {
            return Err(Error::sink(&self.name, "refused"));
        }
        self.seen.lock().unwrap().push(result.host.address.clone());
        Ok(())
    }
}

/// Source returning fixed tokens and counting loads
pub struct CountingSource {
    tokens: Vec<String>,
    loads: AtomicU32,
}

#[allow(dead_code)]
impl CountingSource {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            loads: AtomicU32::new(0),
        }
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut hosts = Vec::new();
        for token in &self.tokens {
            hosts.push(resolver.host(token).await?);
        }
        Ok(hosts)
    }
}

/// `count` distinct private addresses
#[allow(dead_code)]
pub fn addresses(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.{}.{}", i / 250, i % 250 + 1)).collect()
}
