//! Host sources
//!
//! Every source runs its tokens through the [`HostResolver`] and fails as a
//! whole on the first token that does not resolve.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::models::Host;
use crate::remote::{ApiClient, DbClient};
use crate::targets::{HostResolver, HostSource};

/// Hosts given on the command line
#[derive(Debug, Clone, Default)]
pub struct ArgvSource {
    tokens: Vec<String>,
}

impl ArgvSource {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl HostSource for ArgvSource {
    fn name(&self) -> &str {
        "argv"
    }

    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        let mut hosts = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            hosts.push(resolver.host(token).await?);
        }
        Ok(hosts)
    }
}

/// One host per line; blank lines and `#` comments are skipped
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HostSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        let content = tokio::fs::read_to_string(&self.path).await?;

        let mut hosts = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            hosts.push(resolver.host(line).await?);
        }
        Ok(hosts)
    }
}

/// Devices assigned to this server by the API
#[derive(Debug, Clone)]
pub struct ApiSource {
    client: Arc<ApiClient>,
}

impl ApiSource {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HostSource for ApiSource {
    fn name(&self) -> &str {
        "api"
    }

    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        let devices = self.client.load_devices().await?;

        let mut hosts = Vec::with_capacity(devices.len());
        for device in devices {
            let mut host = resolver.host(&device.ip).await?.with_id(device.id);
            host.inactive_since = device.inactive_since();
            hosts.push(host);
        }
        Ok(hosts)
    }
}

/// Devices assigned to this server in the database
#[derive(Debug, Clone)]
pub struct DbSource {
    client: Arc<DbClient>,
}

impl DbSource {
    pub fn new(client: Arc<DbClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HostSource for DbSource {
    fn name(&self) -> &str {
        "db"
    }

    async fn load(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        self.client.load_hosts(resolver).await
    }
}
