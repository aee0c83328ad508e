//! Probe strategies
//!
//! A strategy measures one host and returns exactly one [`ProbeResult`]. The
//! worker pool holds a single shared strategy chosen from [`ProbeConfig::mode`].
//!
//! - [`echo::EchoProbe`] - ICMP echo over raw (privileged) or datagram sockets
//! - [`tcp::TcpConnectProbe`] - one timed TCP connect

pub mod echo;
pub mod tcp;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ProbeConfig, ProbeMode};
use crate::error::Result;
use crate::models::{Host, ProbeResult};

pub use echo::{EchoEvent, EchoFold, EchoProbe, EchoStatistics};
pub use tcp::TcpConnectProbe;

/// One way of measuring a host
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    /// Mode label used in logs and metrics
    fn mode(&self) -> &'static str;

    /// Probe `host` to completion
    ///
    /// An `Err` means the probe could not run at all; unreachable hosts are
    /// reported as results with 100% loss.
    async fn probe(&self, host: &Host) -> Result<ProbeResult>;
}

/// Build the strategy selected by `config.mode`
pub fn build_strategy(config: &ProbeConfig) -> Arc<dyn ProbeStrategy> {
    match config.mode {
        ProbeMode::EchoPrivileged => Arc::new(EchoProbe::new(config, true)),
        ProbeMode::EchoUnprivileged => Arc::new(EchoProbe::new(config, false)),
        ProbeMode::TcpConnect => Arc::new(TcpConnectProbe::new(config.timeout())),
    }
}
