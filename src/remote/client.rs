// ABOUTME: HTTP client for communicating with the remote SQL execution proxy
// ABOUTME: Handles connection tests, batch submission, and error handling

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::models::{
    ConnectionDescriptor, ConnectionTestResult, ExecuteRequest, ExecuteResponse, ProxyAction,
    ProxyRequest,
};
use super::SqlProxy;

/// Extra time granted on top of the proxy-side statement timeout before the HTTP call gives up.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

pub struct RemoteClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl RemoteClient {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        body: &ProxyRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach the SQL proxy. Check the proxy URL and your network connection")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("SQL proxy rejected the request with status {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse SQL proxy response")
    }

    pub async fn test_connection(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<ConnectionTestResult> {
        debug!("Testing connection to {}", connection.display_target());
        let body = ProxyRequest {
            action: ProxyAction::Test,
            connection,
            statements: None,
            options: None,
        };
        self.post(&body, None).await
    }

    pub async fn execute_statements(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        debug!(
            "Submitting {} statements to {}",
            request.statements.len(),
            request.connection.display_target()
        );
        let timeout = Duration::from_millis(request.options.timeout_ms) + TIMEOUT_GRACE;
        self.post(&request.as_proxy_request(), Some(timeout)).await
    }
}

impl SqlProxy for RemoteClient {
    fn test<'a>(
        &'a self,
        connection: &'a ConnectionDescriptor,
    ) -> BoxFuture<'a, Result<ConnectionTestResult>> {
        self.test_connection(connection).boxed()
    }

    fn execute<'a>(&'a self, request: &'a ExecuteRequest) -> BoxFuture<'a, Result<ExecuteResponse>> {
        self.execute_statements(request).boxed()
    }
}
