//! Target registry and host resolution
//!
//! Host tokens come from the command line, files or remote sources and are
//! normalized here into `(address, port)` pairs. The [`TargetRegistry`] holds
//! the ordered snapshot probed during one pass.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::models::Host;

/// Anything that can produce a list of hosts
#[async_trait]
pub trait HostSource: Send + Sync {
    /// Source name used in logs
    fn name(&self) -> &str;

    /// Load hosts, normalizing every token through `resolver`
    ///
    /// The first token that fails to resolve aborts the whole load.
    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>>;
}

/// Turns host tokens into addresses, applying the default port
#[derive(Debug, Clone, Copy)]
pub struct HostResolver {
    default_port: u16,
}

impl HostResolver {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    /// Resolve one token into `(address, port)`
    pub async fn parse(&self, token: &str) -> Result<(String, String)> {
        parse_host(token, self.default_port).await
    }

    /// Resolve one token into a [`Host`]
    pub async fn host(&self, token: &str) -> Result<Host> {
        let (address, port) = self.parse(token).await?;
        Ok(Host::new(address, port))
    }
}

/// Split a token into its address part and optional port
fn split_port(token: &str) -> Result<(&str, Option<&str>)> {
    if let Some(rest) = token.strip_prefix('[') {
        let (inner, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::resolution(token))?;
        return match tail {
            "" => Ok((inner, None)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((inner, Some(port))),
                None => Err(Error::resolution(token)),
            },
        };
    }

    match token.matches(':').count() {
        0 => Ok((token, None)),
        1 => {
            let (addr, port) = token.split_once(':').unwrap_or((token, ""));
            Ok((addr, Some(port)))
        }
        // Bare IPv6, the last group is never a port
        _ => Ok((token, None)),
    }
}

fn is_numeric_name(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn is_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

/// Resolve a host token into `(address, port)`
///
/// Accepts literal IPv4/IPv6 addresses, `host:port`, `[v6]:port`, resolvable
/// hostnames and literal networks (`192.168.1.1/24` yields `192.168.1.1`).
/// Failures name the exact input token.
#[instrument(level = "debug")]
pub async fn parse_host(token: &str, default_port: u16) -> Result<(String, String)> {
    let token = token.trim();
    let (name, port) = split_port(token)?;
    let port = match port {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => default_port.to_string(),
    };

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok((ip.to_string(), port));
    }

    if name.contains('/') {
        let net: IpNet = name.parse().map_err(|_| Error::resolution(token))?;
        return Ok((net.addr().to_string(), port));
    }

    if is_numeric_name(name) || !is_hostname(name) {
        return Err(Error::resolution(token));
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|e| {
            debug!(token = token, error = %e, "DNS lookup failed");
            Error::resolution(token)
        })?
        .map(|sa| sa.ip())
        .collect();

    let ip = addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .ok_or_else(|| Error::resolution(token))?;

    Ok((ip.to_string(), port))
}

/// Ordered, de-duplicated set of hosts for one pass
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    hosts: Vec<Host>,
    seen: HashSet<(String, String)>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append hosts, skipping any `(address, port)` already present
    ///
    /// Returns how many hosts were added.
    pub fn extend(&mut self, hosts: impl IntoIterator<Item = Host>) -> usize {
        let before = self.hosts.len();
        for host in hosts {
            let (address, port) = host.key();
            if self.seen.insert((address.to_owned(), port.to_owned())) {
                self.hosts.push(host);
            } else {
                debug!(host = %host.socket_string(), "Skipping duplicate host");
            }
        }
        self.hosts.len() - before
    }

    /// Load one source and append its hosts
    pub async fn add(&mut self, source: &dyn HostSource, resolver: &HostResolver) -> Result<usize> {
        let hosts = source.load(resolver).await?;
        let added = self.extend(hosts);
        debug!(source = source.name(), added = added, "Loaded hosts");
        Ok(added)
    }

    /// Build a fresh registry from every source
    ///
    /// Fails as a whole when any source fails, so callers can keep their
    /// previous snapshot.
    pub async fn load(sources: &[Arc<dyn HostSource>], resolver: &HostResolver) -> Result<Self> {
        let mut registry = Self::new();
        for source in sources {
            registry.add(source.as_ref(), resolver).await?;
        }
        crate::metrics::set_registry_hosts(registry.len());
        Ok(registry)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
