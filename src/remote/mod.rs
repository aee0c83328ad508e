//! Resilient clients for remote host sources and result sinks
//!
//! - [`api`] - HTTP API with lazy authorization and re-authorization on 401
//! - [`db`] - SQL database with reconnect-and-retry
//!
//! Both clients are built once and shared through `Arc` by the sources and
//! sinks that need them.

pub mod api;
pub mod db;

pub use api::{ApiClient, ApiClientConfig, AuthFailure, Device, Session};
pub use db::{
    DbClient, DbClientConfig, PostgresConnector, SqlConnection, SqlConnector, SqlRow, SqlValue,
    SqliteConnector,
};
