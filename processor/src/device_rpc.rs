use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{BackfillMethodPayload, BackfillRequest};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

/// Extra time the HTTP client waits on top of the device's own response
/// timeout, so the hub reports device timeouts before the client gives up.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Outcome of a device method call. Transport failures are folded into the
/// status: 504 on timeout, 503 when the hub is unreachable, 500 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub status: u16,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MethodResponse {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            status: 200,
            payload,
        }
    }

    pub fn failed(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            payload: json!({ "error": reason.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Invokes the backfill method on the edge device owning a batch.
#[async_trait]
pub trait DeviceRpc: Send + Sync {
    async fn invoke_backfill(&self, request: &BackfillRequest) -> MethodResponse;
}

fn default_method_name() -> String {
    "Backfill".to_string()
}

fn default_api_version() -> String {
    "2021-04-12".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRpcConfig {
    /// Base URL of the device hub.
    pub endpoint: String,
    pub device_id: String,
    pub module_id: String,
    #[serde(default = "default_method_name")]
    pub method_name: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Sent verbatim as the `Authorization` header.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for DeviceRpcConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            device_id: "edge-gateway".to_string(),
            module_id: "relay".to_string(),
            method_name: default_method_name(),
            api_version: default_api_version(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectMethodCall<'a> {
    method_name: &'a str,
    response_timeout_in_seconds: u64,
    payload: BackfillMethodPayload,
}

/// Device method calls through the hub's direct method REST endpoint.
pub struct HttpDeviceRpc {
    client: reqwest::Client,
    config: DeviceRpcConfig,
    response_timeout: Duration,
}

impl HttpDeviceRpc {
    pub fn new(config: DeviceRpcConfig, response_timeout: Duration) -> Result<Self> {
        Self::with_client_timeout(config, response_timeout, response_timeout + CLIENT_TIMEOUT_SLACK)
    }

    pub fn with_client_timeout(
        config: DeviceRpcConfig,
        response_timeout: Duration,
        client_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(client_timeout).build()?;
        Ok(Self {
            client,
            config,
            response_timeout,
        })
    }

    fn method_url(&self) -> String {
        format!(
            "{}/twins/{}/modules/{}/methods?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.device_id,
            self.config.module_id,
            self.config.api_version
        )
    }

    async fn call(&self, request: &BackfillRequest) -> Result<MethodResponse, reqwest::Error> {
        let body = DirectMethodCall {
            method_name: &self.config.method_name,
            response_timeout_in_seconds: self.response_timeout.as_secs().max(1),
            payload: BackfillMethodPayload::from(request),
        };
        let mut builder = self.client.post(self.method_url()).json(&body);
        if let Some(token) = &self.config.auth_token {
            builder = builder.header(AUTHORIZATION, token);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Ok(MethodResponse::failed(status.as_u16(), reason));
        }
        response.json::<MethodResponse>().await
    }
}

#[async_trait]
impl DeviceRpc for HttpDeviceRpc {
    async fn invoke_backfill(&self, request: &BackfillRequest) -> MethodResponse {
        info!(
            %request,
            method = %self.config.method_name,
            device_id = %self.config.device_id,
            "invoking backfill device method"
        );
        let response = match self.call(request).await {
            Ok(response) => response,
            Err(err) => {
                let status = if err.is_timeout() {
                    504
                } else if err.is_connect() {
                    503
                } else {
                    500
                };
                error!(%request, status, "backfill device method call failed: {:?}", err);
                MethodResponse::failed(status, err.to_string())
            }
        };
        info!(
            %request,
            status = response.status,
            payload = %response.payload,
            "backfill device method returned"
        );
        response
    }
}
