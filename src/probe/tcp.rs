//! TCP connect probe

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

use super::ProbeStrategy;
use crate::error::{Error, Result};
use crate::models::{to_ms, Host, ProbeResult};

/// Measures how long one TCP connect to `address:port` takes
///
/// A single attempt is made per host per pass, whatever the configured count.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn target(host: &Host) -> Result<SocketAddr> {
        let port = host
            .port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| Error::probe(&host.address, format!("wrong port number: {}", host.port)))?;

        let ip: IpAddr = host
            .address
            .parse()
            .map_err(|_| Error::probe(&host.address, "not an IP address"))?;

        Ok(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl ProbeStrategy for TcpConnectProbe {
    fn mode(&self) -> &'static str {
        "tcp-connect"
    }

    async fn probe(&self, host: &Host) -> Result<ProbeResult> {
        let target = Self::target(host)?;
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, TcpStream::connect(target)).await;

        let result = match outcome {
            Ok(Ok(stream)) => {
                let rtt = started.elapsed();
                drop(stream);
                let line = format!("Connection to {target} succeeded, time={}", to_ms(rtt));
                ProbeResult::new(host.clone(), 0.0, Some(rtt)).with_output([line])
            }
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "Connect failed");
                let line = format!("Connection to {target} failed, {e}");
                ProbeResult::new(host.clone(), 100.0, None).with_output([line])
            }
            Err(_) => {
                let line = format!(
                    "Connection to {target} failed, timed out after {}",
                    to_ms(self.timeout)
                );
                ProbeResult::new(host.clone(), 100.0, None).with_output([line])
            }
        };

        Ok(result)
    }
}
