//! Unified error handling for the pingfleet crate
//!
//! Every fallible operation in the library returns [`Result`], whose error
//! type is the [`Error`] enum below. Variants follow the failure taxonomy of
//! the probe pipeline:
//!
//! - resolving host tokens ([`Error::HostResolution`])
//! - running probes ([`Error::ProbeExecution`])
//! - talking to the remote API ([`Error::Authentication`], [`Error::RetryExhausted`],
//!   [`Error::UnexpectedStatus`])
//! - talking to the database ([`Error::Connection`])
//! - configuration ([`Error::Config`])
//! - delivering results ([`Error::SinkWrite`])
//!
//! # Usage
//!
//! ```rust,ignore
//! use pingfleet::error::Error;
//!
//! fn handle_error(err: Error) {
//!     tracing::error!(category = err.category().as_str(), error = %err, "pass failed");
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::remote::api::AuthFailure;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Host token could not be turned into an address
    Resolution,
    /// Probe could not be set up or run
    Probe,
    /// HTTP and remote API errors
    Network,
    /// Database and file I/O errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Result delivery errors
    Sink,
    /// Serialization errors
    Parsing,
}

impl ErrorCategory {
    /// Short lowercase label, used as a metrics label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolution => "resolution",
            Self::Probe => "probe",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Sink => "sink",
            Self::Parsing => "parsing",
        }
    }
}

/// Unified error type for the pingfleet crate
#[derive(Error, Debug)]
pub enum Error {
    /// Host token is neither an address, a resolvable name nor a literal network
    #[error("Can't resolve host: {token}")]
    HostResolution { token: String },

    /// Probe could not be constructed or executed for a host
    #[error("Probe of {host} failed: {reason}")]
    ProbeExecution { host: String, reason: String },

    /// Credentials rejected or authentication response unusable
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthFailure),

    /// Bounded retry budget consumed
    #[error("request retry limit exceeded after {attempts} attempts (last status: {last_status:?})")]
    RetryExhausted {
        attempts: u32,
        last_status: Option<u16>,
    },

    /// Remote API answered with a status that is not retried
    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// Database unreachable after every reconnect attempt
    #[error("Database connection failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// A sink failed to record a result
    #[error("Sink '{sink}' write failed: {reason}")]
    SinkWrite { sink: String, reason: String },

    /// Database row or parameter could not be mapped
    #[error("Database error: {0}")]
    Database(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL errors
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a host resolution error for the given token
    pub fn resolution(token: impl Into<String>) -> Self {
        Self::HostResolution {
            token: token.into(),
        }
    }

    /// Create a probe execution error
    pub fn probe(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProbeExecution {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a sink write error
    pub fn sink(sink: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SinkWrite {
            sink: sink.into(),
            reason: reason.to_string(),
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HostResolution { .. } => ErrorCategory::Resolution,
            Self::ProbeExecution { .. } => ErrorCategory::Probe,
            Self::Authentication(_)
            | Self::RetryExhausted { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Http(_) => ErrorCategory::Network,
            Self::Connection { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Sqlite(_)
            | Self::Postgres(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::SinkWrite { .. } => ErrorCategory::Sink,
            Self::Json(_) | Self::Toml(_) => ErrorCategory::Parsing,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
