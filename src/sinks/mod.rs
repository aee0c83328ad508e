//! Result sinks
//!
//! Each sink receives every probe result from its own queue in the fan-out
//! distributor, so a slow sink never reorders another sink's stream.
//!
//! - [`StdoutSink`] - diagnostic lines to standard output
//! - [`FileSink`] - diagnostic lines appended to a file
//! - [`ApiSink`] - loss and average time posted to the device API
//! - [`DbSink`] - loss, average time and liveness written to the database

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::models::ProbeResult;
use crate::remote::{ApiClient, DbClient};

/// Destination for probe results
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Sink name used in logs, metrics and the distribution report
    fn name(&self) -> &str;

    /// Record one result
    async fn write(&self, result: &ProbeResult) -> Result<()>;
}

/// Prints diagnostic lines
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl ResultSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&self, result: &ProbeResult) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        for line in &result.output {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;
        Ok(())
    }
}

/// Appends diagnostic lines to a file, creating it when missing
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ResultSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, result: &ProbeResult) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut buffer = String::new();
        for line in &result.output {
            buffer.push_str(line);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Posts results of hosts that came from the API
#[derive(Debug, Clone)]
pub struct ApiSink {
    client: Arc<ApiClient>,
}

impl ApiSink {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultSink for ApiSink {
    fn name(&self) -> &str {
        "api"
    }

    async fn write(&self, result: &ProbeResult) -> Result<()> {
        if result.host.id == 0 {
            tracing::debug!(host = %result.host, "Host has no API id, skipping");
            return Ok(());
        }

        self.client
            .update_device(result.host.id, result.loss, result.avg_time_secs())
            .await
    }
}

/// Stores results of hosts that came from the database
#[derive(Debug, Clone)]
pub struct DbSink {
    client: Arc<DbClient>,
}

impl DbSink {
    pub fn new(client: Arc<DbClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultSink for DbSink {
    fn name(&self) -> &str {
        "db"
    }

    async fn write(&self, result: &ProbeResult) -> Result<()> {
        self.client.save_result(result).await
    }
}
