//! ICMP echo probe
//!
//! Packets are sent through `surge-ping`. Each reply becomes an
//! [`EchoEvent::Reply`] and the run ends with one [`EchoEvent::Finished`]
//! carrying the statistics. [`EchoFold`] turns that stream into a result.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::IpAddr;
use std::time::Duration;
use surge_ping::{Client, Config as PingConfig, IcmpPacket, PingIdentifier, PingSequence, ICMP};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

use super::ProbeStrategy;
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::models::{to_ms, Host, ProbeResult};

const PAYLOAD: [u8; 56] = [0; 56];

/// Event produced while echoing one host
#[derive(Debug, Clone, PartialEq)]
pub enum EchoEvent {
    Reply {
        bytes: usize,
        addr: String,
        seq: u16,
        rtt: Duration,
    },
    Finished(EchoStatistics),
}

/// Summary of one echo run
#[derive(Debug, Clone, PartialEq)]
pub struct EchoStatistics {
    pub addr: String,
    pub sent: u32,
    pub received: u32,
    pub min_rtt: Duration,
    pub avg_rtt: Duration,
    pub max_rtt: Duration,
    pub stddev_rtt: Duration,
}

impl EchoStatistics {
    /// Compute statistics from the round-trip times of received replies
    pub fn from_rtts(addr: impl Into<String>, sent: u32, rtts: &[Duration]) -> Self {
        let received = rtts.len() as u32;
        let (min_rtt, avg_rtt, max_rtt, stddev_rtt) = if rtts.is_empty() {
            (Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::ZERO)
        } else {
            let secs: Vec<f64> = rtts.iter().map(Duration::as_secs_f64).collect();
            let mean = secs.iter().sum::<f64>() / secs.len() as f64;
            let variance =
                secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / secs.len() as f64;
            (
                rtts.iter().copied().min().unwrap_or_default(),
                Duration::from_secs_f64(mean),
                rtts.iter().copied().max().unwrap_or_default(),
                Duration::from_secs_f64(variance.sqrt()),
            )
        };

        Self {
            addr: addr.into(),
            sent,
            received,
            min_rtt,
            avg_rtt,
            max_rtt,
            stddev_rtt,
        }
    }

    /// Loss percentage; nothing sent counts as total loss
    pub fn loss(&self) -> f64 {
        if self.sent == 0 {
            return 100.0;
        }
        f64::from(self.sent.saturating_sub(self.received)) / f64::from(self.sent) * 100.0
    }
}

/// Folds echo events into a [`ProbeResult`]
#[derive(Debug)]
pub struct EchoFold {
    host: Host,
    print_replies: bool,
    output: Vec<String>,
    stats: Option<EchoStatistics>,
}

impl EchoFold {
    /// With `print_replies` set, reply lines go straight to stdout instead of
    /// the result
    pub fn new(host: Host, print_replies: bool) -> Self {
        Self {
            host,
            print_replies,
            output: Vec::new(),
            stats: None,
        }
    }

    pub fn push(&mut self, event: EchoEvent) {
        match event {
            EchoEvent::Reply {
                bytes,
                addr,
                seq,
                rtt,
            } => {
                let line = format!("{bytes} bytes from {addr}: icmp_seq={seq} time={}", to_ms(rtt));
                if self.print_replies {
                    println!("{line}");
                } else {
                    self.output.push(line);
                }
            }
            EchoEvent::Finished(stats) => {
                self.output.push(format!("--- {} ping statistics ---", stats.addr));
                self.output.push(format!(
                    "{} packets transmitted, {} packets received, {}% packet loss",
                    stats.sent,
                    stats.received,
                    stats.loss()
                ));
                self.output.push(format!(
                    "round-trip min/avg/max/stddev = {}/{}/{}/{}",
                    to_ms(stats.min_rtt),
                    to_ms(stats.avg_rtt),
                    to_ms(stats.max_rtt),
                    to_ms(stats.stddev_rtt)
                ));
                self.stats = Some(stats);
            }
        }
    }

    /// Fold a complete event stream
    pub fn fold(host: Host, print_replies: bool, events: impl IntoIterator<Item = EchoEvent>) -> ProbeResult {
        let mut fold = Self::new(host, print_replies);
        for event in events {
            fold.push(event);
        }
        fold.finish()
    }

    pub fn finish(self) -> ProbeResult {
        let (loss, avg) = match &self.stats {
            Some(stats) if stats.received > 0 => (stats.loss(), Some(stats.avg_rtt)),
            Some(stats) => (stats.loss(), None),
            None => (100.0, None),
        };
        ProbeResult::new(self.host, loss, avg).with_output(self.output)
    }
}

/// Offsets from the start of a run at which echo requests go out
///
/// One request per `interval` until `count` are scheduled; an offset at or
/// past `timeout` is dropped, so all `count` go out whenever
/// `(count - 1) * interval < timeout`.
pub fn send_schedule(count: u32, interval: Duration, timeout: Duration) -> Vec<Duration> {
    (0..count)
        .map_while(|k| interval.checked_mul(k).filter(|offset| *offset < timeout))
        .collect()
}

/// ICMP echo over raw or datagram sockets
///
/// Requests leave on a fixed schedule independent of replies; replies are
/// collected until the per-host deadline.
pub struct EchoProbe {
    privileged: bool,
    count: u32,
    interval: Duration,
    timeout: Duration,
    print_replies: bool,
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
}

impl EchoProbe {
    pub fn new(config: &ProbeConfig, privileged: bool) -> Self {
        Self {
            privileged,
            count: config.count.max(1),
            interval: config.interval,
            timeout: config.timeout(),
            print_replies: config.verbose && !config.grouped,
            v4: OnceCell::new(),
            v6: OnceCell::new(),
        }
    }

    /// Socket client for the address family, created on first use
    async fn client(&self, ip: IpAddr) -> Result<Client> {
        let (cell, kind) = match ip {
            IpAddr::V4(_) => (&self.v4, ICMP::V4),
            IpAddr::V6(_) => (&self.v6, ICMP::V6),
        };
        let sock_type = if self.privileged {
            socket2::Type::RAW
        } else {
            socket2::Type::DGRAM
        };

        cell.get_or_try_init(|| async move {
            let config = PingConfig::builder()
                .kind(kind)
                .sock_type_hint(sock_type)
                .build();
            Client::new(&config).map_err(|e| Error::probe(ip.to_string(), format!("cannot open ICMP socket: {e}")))
        })
        .await
        .cloned()
    }
}

#[async_trait]
impl ProbeStrategy for EchoProbe {
    fn mode(&self) -> &'static str {
        if self.privileged {
            "echo-privileged"
        } else {
            "echo-unprivileged"
        }
    }

    async fn probe(&self, host: &Host) -> Result<ProbeResult> {
        let ip: IpAddr = host
            .address
            .parse()
            .map_err(|_| Error::probe(&host.address, "not an IP address"))?;

        let schedule = send_schedule(self.count, self.interval, self.timeout);
        let sent = schedule.len() as u32;
        let mut fold = EchoFold::new(host.clone(), self.print_replies);
        let mut rtts = Vec::with_capacity(schedule.len());

        if !schedule.is_empty() {
            let client = self.client(ip).await?;
            let ident = PingIdentifier(rand::random());
            let start = Instant::now();
            let deadline = start + self.timeout;

            let mut replies: FuturesUnordered<_> = (0..=u16::MAX)
                .zip(schedule)
                .map(|(seq, offset)| {
                    let client = client.clone();
                    async move {
                        tokio::time::sleep_until(start + offset).await;
                        let mut pinger = client.pinger(ip, ident).await;
                        pinger.timeout(deadline.saturating_duration_since(Instant::now()));
                        (seq, pinger.ping(PingSequence(seq), &PAYLOAD).await)
                    }
                })
                .collect();

            while let Some((seq, outcome)) = replies.next().await {
                match outcome {
                    Ok((packet, rtt)) => {
                        let bytes = match packet {
                            IcmpPacket::V4(p) => p.get_size(),
                            IcmpPacket::V6(p) => p.get_size(),
                        };
                        rtts.push(rtt);
                        fold.push(EchoEvent::Reply {
                            bytes,
                            addr: host.address.clone(),
                            seq,
                            rtt,
                        });
                    }
                    Err(e) => debug!(host = %host, seq = seq, error = %e, "No echo reply"),
                }
            }
        }

        fold.push(EchoEvent::Finished(EchoStatistics::from_rtts(
            &host.address,
            sent,
            &rtts,
        )));
        Ok(fold.finish())
    }
}

impl std::fmt::Debug for EchoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoProbe")
            .field("privileged", &self.privileged)
            .field("count", &self.count)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
