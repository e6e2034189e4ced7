//! HTTP sub-client for request/response platform operations
//!
//! Resolves the base URL once at construction and rejects malformed URLs
//! there. Every request carries JSON content headers, a product/agent-id
//! user agent, and the bearer token when one is configured. Non-2xx
//! responses fail with the HTTP status and a truncated body.

use crate::config::TlsSection;
use crate::protocol::model::{
    AgentIdentity, AgentMetrics, AppliedConfig, HeartbeatRequest, PipelineConfig, StatusReport,
};
use crate::transport::{tls, TransportError};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

const MAX_ERROR_BODY: usize = 256;

/// HTTP client for the platform's REST endpoints
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpClient {
    /// Build the client; fails on a malformed base URL or bad TLS material
    pub fn new(
        base_url: &str,
        agent_id: &str,
        token: Option<&str>,
        request_timeout: Duration,
        tls_section: Option<&TlsSection>,
    ) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base_url.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidUrl("bearer token is not ASCII".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("pipeagent/{agent_id}"))
            .timeout(request_timeout);

        if let Some(section) = tls_section {
            builder = tls::apply_to_reqwest(builder, section)?;
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::http("building HTTP client", e))?;

        Ok(Self { base_url, client })
    }

    /// Base URL this client was constructed with
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Register this agent with the platform
    pub async fn register(&self, identity: &AgentIdentity) -> Result<(), TransportError> {
        self.send_json(
            Method::POST,
            "/api/v1/agents/register",
            identity,
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await
    }

    /// Post a liveness heartbeat
    pub async fn send_heartbeat(&self, agent_id: &str) -> Result<(), TransportError> {
        let body = HeartbeatRequest {
            timestamp: Utc::now().timestamp(),
        };
        self.send_json(
            Method::POST,
            &format!("/api/v1/agents/{agent_id}/heartbeat"),
            &body,
            &[StatusCode::OK],
        )
        .await
    }

    /// Replace the platform's view of this agent's status
    pub async fn report_status(
        &self,
        agent_id: &str,
        report: &StatusReport,
    ) -> Result<(), TransportError> {
        self.send_json(
            Method::PUT,
            &format!("/api/v1/agents/{agent_id}/status"),
            report,
            &[StatusCode::OK],
        )
        .await
    }

    /// Fetch one pipeline configuration
    pub async fn fetch_config(&self, config_id: &str) -> Result<PipelineConfig, TransportError> {
        self.get_json(&format!("/api/v1/configs/{config_id}")).await
    }

    /// Report a successfully applied configuration
    pub async fn report_config_applied(
        &self,
        agent_id: &str,
        applied: &AppliedConfig,
    ) -> Result<(), TransportError> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/agents/{agent_id}/configs/applied"),
            applied,
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await
    }

    /// Report a metrics sample
    pub async fn report_metrics(
        &self,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> Result<(), TransportError> {
        self.send_json(
            Method::POST,
            &format!("/api/v1/agents/{agent_id}/metrics"),
            metrics,
            &[StatusCode::OK, StatusCode::CREATED],
        )
        .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        ok_statuses: &[StatusCode],
    ) -> Result<(), TransportError> {
        let url = self.endpoint(path)?;
        debug!(method = %method, url = %url, "platform request");

        let response = self
            .client
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::http(format!("requesting {path}"), e))?;

        Self::expect_status(response, ok_statuses).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "platform fetch");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::http(format!("requesting {path}"), e))?;

        let response = Self::expect_status(response, &[StatusCode::OK]).await?;
        response
            .json()
            .await
            .map_err(|e| TransportError::http(format!("decoding {path} response"), e))
    }

    async fn expect_status(
        response: reqwest::Response,
        ok_statuses: &[StatusCode],
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if ok_statuses.contains(&status) {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(TransportError::RemoteRejected {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
