//! Provider node executor and the external provider client port.
//!
//! Provider nodes call external processing services (matting, relighting,
//! upscaling, try-on rendering). `sync` mode invokes the provider and
//! returns its output inline; `async` mode submits the job to external
//! compute and suspends -- the node completes minutes later through the
//! signed completion callback.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::NodeKind;

use super::{NodeContext, NodeExecution, NodeExecutor, PendingStep};

// ---------------------------------------------------------------------------
// Provider client port
// ---------------------------------------------------------------------------

/// One provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider_ref: String,
    pub payload: Value,
    pub run_id: Uuid,
    pub node_id: String,
    /// Present for async submissions; workers echo it back in the callback.
    pub step_index: Option<u32>,
}

/// Result of an async submission.
#[derive(Debug, Clone)]
pub struct ProviderSubmission {
    /// Reference assigned by the provider, if the gateway returns one.
    pub provider_task_ref: Option<String>,
}

/// Port to the external provider gateway. Implemented by the infra layer.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Synchronous call; returns the provider output inline.
    async fn invoke(&self, request: &ProviderRequest) -> Result<Value, NodeError>;

    /// Asynchronous submission; the step completes via callback.
    async fn submit(&self, request: &ProviderRequest) -> Result<ProviderSubmission, NodeError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProviderMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderConfig {
    provider_ref: String,
    #[serde(default)]
    mode: ProviderMode,
    #[serde(default)]
    payload: Value,
    /// Optional state key the output is also written to.
    #[serde(default)]
    output_key: Option<String>,
}

fn parse_config(config: &Value) -> Result<ProviderConfig, NodeError> {
    let config: ProviderConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::invalid_config(format!("provider config: {e}")))?;
    if config.provider_ref.is_empty() {
        return Err(NodeError::invalid_config("provider nodes require 'providerRef'"));
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executor for `provider` nodes.
pub struct ProviderExecutor {
    client: Arc<dyn ProviderClient>,
}

impl ProviderExecutor {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeExecutor for ProviderExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Provider
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        let config = parse_config(&ctx.inputs)?;

        let (run_id, node_id) = {
            let run = ctx.run.lock().await;
            (run.run_id, ctx.node.id.clone())
        };

        let request = ProviderRequest {
            provider_ref: config.provider_ref.clone(),
            payload: config.payload.clone(),
            run_id,
            node_id: node_id.clone(),
            step_index: ctx.step_index,
        };

        match config.mode {
            ProviderMode::Sync => {
                let output = self.client.invoke(&request).await?;
                if let Some(key) = &config.output_key {
                    let mut run = ctx.run.lock().await;
                    run.set_state(key, output.clone());
                }
                Ok(NodeExecution::completed_with_metadata(
                    output,
                    json!({ "providerRef": config.provider_ref, "attempt": ctx.attempt }),
                    started,
                ))
            }
            ProviderMode::Async => {
                let step_index = ctx.step_index.ok_or_else(|| {
                    NodeError::internal(format!("async provider node '{node_id}' has no step index"))
                })?;
                let submission = self.client.submit(&request).await?;
                tracing::info!(
                    run_id = %run_id,
                    node_id = node_id.as_str(),
                    step_index,
                    provider_ref = config.provider_ref.as_str(),
                    "submitted async provider step"
                );
                Ok(NodeExecution::Suspended(PendingStep {
                    step_index,
                    provider_ref: config.provider_ref,
                    provider_task_ref: submission.provider_task_ref,
                }))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
