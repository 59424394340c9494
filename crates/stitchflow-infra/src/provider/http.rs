//! HTTP client for the external provider gateway.
//!
//! Synchronous invocations return their output in the response body; async
//! submissions carry the run/step coordinates and the callback URL, and the
//! worker reports completion later through the signed callback endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use stitchflow_core::node::{ProviderClient, ProviderRequest, ProviderSubmission};
use stitchflow_types::error::NodeError;

/// Reqwest-backed [`ProviderClient`].
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    callback_base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default)]
    task_ref: Option<String>,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, callback_base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            callback_base_url: callback_base_url.into(),
        }
    }

    fn endpoint(&self, provider_ref: &str, action: &str) -> String {
        format!(
            "{}/v1/providers/{}/{}",
            self.base_url.trim_end_matches('/'),
            provider_ref,
            action
        )
    }

    fn callback_url(&self) -> String {
        format!(
            "{}/api/v1/callbacks/steps",
            self.callback_base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, NodeError> {
        let response = self
            .http
            .post(self.endpoint(&request.provider_ref, "invoke"))
            .json(&json!({
                "runId": request.run_id,
                "nodeId": request.node_id,
                "payload": request.payload,
            }))
            .send()
            .await
            .map_err(|e| {
                NodeError::provider(format!("provider '{}' unreachable: {e}", request.provider_ref))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::provider(format!(
                "provider '{}' returned {status}",
                request.provider_ref
            )));
        }

        response.json().await.map_err(|e| {
            NodeError::provider(format!(
                "provider '{}' sent invalid JSON: {e}",
                request.provider_ref
            ))
        })
    }

    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderSubmission, NodeError> {
        let response = self
            .http
            .post(self.endpoint(&request.provider_ref, "submit"))
            .json(&json!({
                "taskId": request.run_id,
                "stepIndex": request.step_index,
                "nodeId": request.node_id,
                "payload": request.payload,
                "callbackUrl": self.callback_url(),
            }))
            .send()
            .await
            .map_err(|e| {
                NodeError::provider(format!("provider '{}' unreachable: {e}", request.provider_ref))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::provider(format!(
                "provider '{}' rejected submission with {status}",
                request.provider_ref
            )));
        }

        let body: SubmitResponse = response.json().await.map_err(|e| {
            NodeError::provider(format!(
                "provider '{}' sent invalid JSON: {e}",
                request.provider_ref
            ))
        })?;

        tracing::debug!(
            provider_ref = request.provider_ref.as_str(),
            task_ref = body.task_ref.as_deref().unwrap_or("-"),
            "async submission accepted"
        );

        Ok(ProviderSubmission {
            provider_task_ref: body.task_ref,
        })
    }
}
