//! HTTP client for the agent's REST surface.
//!
//! Covers the non-push endpoints the dashboard uses: system static info,
//! configured service cards, and the agent health report. Requests are short
//! and idempotent, so failures retry with tight bounded backoff.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Base URL of an agent running on this machine with default config.
pub const LOCAL_AGENT_BASE_URL: &str = "http://localhost:9876";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AgentApiDefaults;

impl AgentApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
}

/// Tuning knobs for [`AgentApiClient`].
#[derive(Clone, Debug)]
pub struct AgentApiOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for AgentApiOptions {
    fn default() -> Self {
        Self {
            connect_timeout: AgentApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: AgentApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::local_agent(),
        }
    }
}

/// Client for the agent's HTTP endpoints.
#[derive(Clone)]
pub struct AgentApiClient {
    http: Client,
    api_key: Option<SecretString>,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl AgentApiClient {
    /// Creates a client for an agent on localhost with default options.
    pub fn new() -> Result<Self, AgentApiError> {
        Self::with_options(None, AgentApiOptions::default())
    }

    /// Creates a client that authenticates with an API key.
    pub fn with_api_key(api_key: SecretString) -> Result<Self, AgentApiError> {
        Self::with_options(Some(api_key), AgentApiOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(
        api_key: Option<SecretString>,
        options: AgentApiOptions,
    ) -> Result<Self, AgentApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AgentApiError::Transport)?;

        Ok(Self {
            http,
            api_key,
            base_url: LOCAL_AGENT_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Points the client at a different agent.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    /// Fetches host facts that do not change between snapshots.
    pub async fn system_static(&self) -> Result<SystemStaticInfo, AgentApiError> {
        self.get_json("/api/system/static").await
    }

    /// Fetches the configured service cards with their probed status.
    pub async fn services(&self) -> Result<Vec<ServiceCard>, AgentApiError> {
        self.get_json("/api/services").await
    }

    /// Fetches the agent's own health report.
    pub async fn health(&self) -> Result<HealthReport, AgentApiError> {
        self.get_json("/health").await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AgentApiError> {
        let endpoint = self.endpoint(path);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move {
                    debug!(event = "agent_api_request", endpoint = %endpoint, attempt);
                    self.get_attempt(&endpoint).await
                }
            },
            AgentApiError::is_retryable,
        )
        .await
    }

    async fn get_attempt<T: DeserializeOwned>(
        &self,
        endpoint: &str,
    ) -> Result<T, AgentApiError> {
        let mut builder = self.http.get(endpoint).timeout(self.attempt_timeout);

        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(AgentApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(AgentApiError::Transport)?;

        if !status.is_success() {
            return Err(AgentApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| AgentApiError::Decode {
            detail: err.to_string(),
            body: summarize_error_body(&body),
        })
    }
}

/// Host facts served by `/api/system/static`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemStaticInfo {
    pub os_name: String,
    pub kernel_version: String,
    pub hostname: String,
    pub cpu_cores: usize,
    pub cpu_brand: String,
    pub total_memory_gb: f64,
}

/// One configured service tile with its probed reachability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceCard {
    pub name: String,
    pub url: String,
    pub icon: String,
    pub description: String,
    pub status: ServiceStatus,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Offline,
}

/// Agent self-report served by `/health`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// `healthy` or `degraded`.
    pub status: String,
    /// RFC 3339 timestamp as the agent serializes it; relayed, not parsed.
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub collectors: HashMap<String, CollectorHealth>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CollectorHealth {
    pub name: String,
    pub status: String,
    pub last_update: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Errors produced by agent HTTP requests.
#[derive(Debug, Error)]
pub enum AgentApiError {
    /// Request could not be sent or the response body not read.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Agent answered with a non-success status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Response body did not match the expected shape.
    #[error("failed to decode response: {detail}. body={body}")]
    Decode { detail: String, body: String },
}

impl AgentApiError {
    /// Whether another attempt is worth scheduling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decode { .. } => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut snippet: String = trimmed.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
    if trimmed.chars().count() > ERROR_BODY_SNIPPET_LEN {
        snippet.push('…');
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::{
        summarize_error_body, AgentApiClient, AgentApiError, ServiceStatus, SystemStaticInfo,
        LOCAL_AGENT_BASE_URL,
    };
    use reqwest::StatusCode;

    #[test]
    fn client_targets_local_agent_by_default() {
        let client = AgentApiClient::new().expect("build client");
        assert_eq!(client.endpoint("/health"), format!("{LOCAL_AGENT_BASE_URL}/health"));
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let client = AgentApiClient::new()
            .expect("build client")
            .with_base_url("http://monitor.lan:9876/  \n");
        assert_eq!(
            client.endpoint("/api/services"),
            "http://monitor.lan:9876/api/services"
        );
    }

    #[test]
    fn service_status_uses_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::Online).expect("encode"),
            "\"online\""
        );
        let decoded: ServiceStatus =
            serde_json::from_str("\"offline\"").expect("decode");
        assert_eq!(decoded, ServiceStatus::Offline);
    }

    #[test]
    fn system_static_info_decodes_agent_json() {
        let info: SystemStaticInfo = serde_json::from_str(
            r#"{
                "os_name": "Debian GNU/Linux 12",
                "kernel_version": "6.1.0-18-amd64",
                "hostname": "homelab",
                "cpu_cores": 8,
                "cpu_brand": "Intel(R) N100",
                "total_memory_gb": 15.4
            }"#,
        )
        .expect("decode static info");
        assert_eq!(info.hostname, "homelab");
        assert_eq!(info.cpu_cores, 8);
    }

    #[test]
    fn server_errors_are_retryable_but_client_errors_are_not() {
        let server = AgentApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: "<empty body>".to_string(),
        };
        assert!(server.is_retryable());

        let client = AgentApiError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: "<empty body>".to_string(),
        };
        assert!(!client.is_retryable());

        let decode = AgentApiError::Decode {
            detail: "missing field".to_string(),
            body: "{}".to_string(),
        };
        assert!(!decode.is_retryable());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let snippet = summarize_error_body(&body);
        assert!(snippet.chars().count() <= 221);
        assert!(snippet.ends_with('…'));
        assert_eq!(summarize_error_body("   "), "<empty body>");
    }
}
