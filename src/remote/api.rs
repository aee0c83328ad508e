//! HTTP API client with lazy authorization
//!
//! The client authorizes on first use, attaches the session token to every
//! resource call and re-authorizes when the server answers 401. Server errors
//! are retried after a fixed delay; every resource call counts against one
//! shared attempt budget.

use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ApiConfig, ApiEndpoints};
use crate::error::{Error, Result};
use crate::utils::{fill_template, join_url};

/// Header carrying the session token
pub const AUTH_HEADER: &str = "X-Auth-Token";

// ============================================================================
// Errors
// ============================================================================

/// Why authorization failed
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("server rejected credentials with status {status}")]
    Rejected { status: u16 },

    #[error("Invalid JSON response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// API base URL
    pub base_url: String,

    pub name: String,

    pub secret: String,

    pub endpoints: ApiEndpoints,

    /// Request timeout
    pub timeout: Duration,

    /// Attempts per logical request
    pub max_attempts: u32,

    /// Delay before retrying a server error
    pub retry_delay: Duration,
}

impl ApiClientConfig {
    /// Create a config with default endpoints and retry policy
    pub fn new(
        base_url: impl Into<String>,
        name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            name: name.into(),
            secret: secret.into(),
            endpoints: ApiEndpoints::default(),
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Set retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set endpoint templates
    pub fn with_endpoints(mut self, endpoints: ApiEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

impl From<&ApiConfig> for ApiClientConfig {
    fn from(config: &ApiConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            name: config.name.clone(),
            secret: config.secret.clone(),
            endpoints: config.endpoints.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    id_server: i64,
}

/// Device entry returned by the device list endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub id: i64,
    pub ip: String,
    #[serde(default)]
    pub inactive_since: Option<String>,
}

impl Device {
    /// Parsed inactive-since timestamp; empty or malformed values count as unset
    pub fn inactive_since(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inactive_since
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

#[derive(Debug, Serialize)]
struct DeviceUpdate {
    loss: f64,
    average_time: f64,
}

// ============================================================================
// API Client
// ============================================================================

/// Authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub server_id: i64,
}

#[derive(Debug)]
enum AuthState {
    Unauthenticated,
    Authorizing,
    Authorized(Session),
}

/// Client for the device API
pub struct ApiClient {
    config: ApiClientConfig,
    http_client: Client,
    state: Mutex<AuthState>,
}

impl ApiClient {
    /// Create a new API client; no request is made until first use
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        let http_client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            http_client,
            state: Mutex::new(AuthState::Unauthenticated),
        })
    }

    /// Current session, if authorized
    pub async fn session(&self) -> Option<Session> {
        match &*self.state.lock().await {
            AuthState::Authorized(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Authorize unless a session already exists
    pub async fn ensure_session(&self) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let AuthState::Authorized(session) = &*state {
            return Ok(session.clone());
        }
        self.authorize_locked(&mut state).await
    }

    /// Replace the session unless another caller already replaced `stale`
    async fn reauthorize(&self, stale: &Session) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let AuthState::Authorized(current) = &*state {
            if current != stale {
                return Ok(current.clone());
            }
        }
        self.authorize_locked(&mut state).await
    }

    async fn authorize_locked(&self, state: &mut AuthState) -> Result<Session> {
        *state = AuthState::Authorizing;

        match self.authorize().await {
            Ok(session) => {
                info!(server_id = session.server_id, "Authorized with API");
                *state = AuthState::Authorized(session.clone());
                Ok(session)
            }
            Err(e) => {
                *state = AuthState::Unauthenticated;
                Err(e)
            }
        }
    }

    /// POST credentials to the auth endpoint
    async fn authorize(&self) -> Result<Session> {
        let url = join_url(&self.config.base_url, &self.config.endpoints.authenticate);
        let request = AuthRequest {
            name: &self.config.name,
            secret: &self.config.secret,
        };

        let response = self.http_client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthFailure::Rejected {
                status: status.as_u16(),
            }
            .into());
        }

        let body = response.text().await?;
        let auth: AuthResponse = serde_json::from_str(&body)
            .map_err(|e| AuthFailure::InvalidResponse(e.to_string()))?;

        Ok(Session {
            token: auth.token,
            server_id: auth.id_server,
        })
    }

    /// Send an authorized request
    ///
    /// `{server_id}` in `endpoint` is filled from the session. On 401 the
    /// client re-authorizes and tries again; on 5xx or transport failure it
    /// waits the retry delay. Other statuses fail immediately.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut session = self.ensure_session().await?;
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            let server_id = session.server_id.to_string();
            let path = fill_template(endpoint, &[("server_id", &server_id)]);
            let url = join_url(&self.config.base_url, &path);

            let mut request = self
                .http_client
                .request(method.clone(), &url)
                .header(AUTH_HEADER, &session.token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let status = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => response.status(),
                Err(e) => {
                    warn!(url = %url, attempt = attempt, error = %e, "Request failed");
                    last_status = None;
                    if attempt < max_attempts {
                        crate::metrics::record_remote_retry("api");
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    continue;
                }
            };

            last_status = Some(status.as_u16());

            if status == StatusCode::UNAUTHORIZED {
                debug!(url = %url, attempt = attempt, "Session rejected, re-authorizing");
                if attempt < max_attempts {
                    crate::metrics::record_remote_retry("api");
                    session = self.reauthorize(&session).await?;
                }
                continue;
            }

            if status.is_server_error() {
                warn!(url = %url, attempt = attempt, status = status.as_u16(), "Server error");
                if attempt < max_attempts {
                    crate::metrics::record_remote_retry("api");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                continue;
            }

            return Err(Error::UnexpectedStatus {
                status: status.as_u16(),
                url,
            });
        }

        Err(Error::RetryExhausted {
            attempts: max_attempts,
            last_status,
        })
    }

    /// Fetch the device list of this server
    pub async fn load_devices(&self) -> Result<Vec<Device>> {
        let response = self
            .request(Method::GET, &self.config.endpoints.get_devices, None)
            .await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Report loss and average time of one device
    pub async fn update_device(&self, id: i64, loss: f64, average_time: f64) -> Result<()> {
        let id = id.to_string();
        let endpoint = fill_template(&self.config.endpoints.update_device, &[("id", &id)]);
        let body = serde_json::to_value(DeviceUpdate { loss, average_time })?;

        self.request(Method::POST, &endpoint, Some(&body)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.config.base_url)
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}
