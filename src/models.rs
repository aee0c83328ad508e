//! Core data structures for pingfleet

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One network endpoint subject to probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Host {
    /// Identifier assigned by a remote source, 0 when supplied locally
    #[serde(default)]
    pub id: i64,
    /// Resolved IP address
    pub address: String,
    /// Service port, default applied at load time
    #[serde(default)]
    pub port: String,
    /// Set by liveness-tracking sinks while the host keeps failing
    #[serde(default)]
    pub inactive_since: Option<DateTime<Utc>>,
}

impl Host {
    /// Host known only by address and port
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            id: 0,
            address: address.into(),
            port: port.into(),
            inactive_since: None,
        }
    }

    /// Attach the remote identifier
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// De-duplication key
    pub fn key(&self) -> (&str, &str) {
        (&self.address, &self.port)
    }

    /// `address:port`, bracketing IPv6 addresses
    pub fn socket_string(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Outcome tag of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// At least one reply or connection
    Up,
    /// Everything lost
    Down,
    /// Probe could not run at all
    Error,
}

impl ProbeStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Error => "error",
        }
    }
}

/// Measurements for one host from one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub host: Host,
    /// Human-readable diagnostic lines, in production order
    pub output: Vec<String>,
    /// Loss percentage, 0 to 100
    pub loss: f64,
    /// Average round-trip time in seconds, `None` when nothing came back
    pub avg_rtt: Option<f64>,
    pub status: Option<ProbeStatus>,
    pub probed_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Build a result from loss and average round-trip time
    pub fn new(host: Host, loss: f64, avg_rtt: Option<Duration>) -> Self {
        let status = if loss >= 100.0 {
            ProbeStatus::Down
        } else {
            ProbeStatus::Up
        };

        Self {
            host,
            output: Vec::new(),
            loss,
            avg_rtt: avg_rtt.map(|d| d.as_secs_f64()),
            status: Some(status),
            probed_at: Utc::now(),
        }
    }

    /// Result standing in for a probe that could not run
    pub fn failed(host: Host, reason: impl Into<String>) -> Self {
        Self {
            host,
            output: vec![reason.into()],
            loss: 100.0,
            avg_rtt: None,
            status: Some(ProbeStatus::Error),
            probed_at: Utc::now(),
        }
    }

    /// Append diagnostic lines
    pub fn with_output(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.output.extend(lines);
        self
    }

    /// True when nothing came back
    pub fn is_total_loss(&self) -> bool {
        self.loss >= 100.0
    }

    /// Average round-trip time as reported to sinks, 0 when undefined
    pub fn avg_time_secs(&self) -> f64 {
        self.avg_rtt.unwrap_or(0.0)
    }
}

/// Format a duration the way ping does, with millisecond precision
pub fn to_ms(duration: Duration) -> String {
    format!("{:.3}ms", duration.as_nanos() as f64 / 1e6)
}
