//! Input and output boundary markers.
//!
//! `input` seeds and validates the caller's form fields at the entry of the
//! graph; `output` collects configured state keys into the run's final
//! artifact at the exit.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::NodeKind;

use super::{NodeContext, NodeExecution, NodeExecutor};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct InputConfig {
    /// Form fields that must be present for the run to proceed.
    #[serde(default)]
    fields: Vec<String>,
}

/// Executor for `input` nodes.
pub struct InputExecutor;

#[async_trait]
impl NodeExecutor for InputExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<InputConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| NodeError::invalid_config(format!("input config: {e}")))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        let config: InputConfig = serde_json::from_value(ctx.node.config.clone())
            .map_err(|e| NodeError::invalid_config(format!("input config: {e}")))?;

        let run = ctx.run.lock().await;
        for field in &config.fields {
            if !run.form.contains_key(field) {
                return Err(NodeError::missing_input(format!(
                    "required form field '{field}' is missing"
                )));
            }
        }
        Ok(NodeExecution::completed(
            Value::Object(run.form.clone()),
            started,
        ))
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct OutputConfig {
    /// State keys collected into the run artifact. Empty collects all state.
    #[serde(default)]
    keys: Vec<String>,
}

/// Executor for `output` nodes.
pub struct OutputExecutor;

#[async_trait]
impl NodeExecutor for OutputExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Output
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<OutputConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| NodeError::invalid_config(format!("output config: {e}")))
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        let config: OutputConfig = serde_json::from_value(ctx.node.config.clone())
            .map_err(|e| NodeError::invalid_config(format!("output config: {e}")))?;

        let mut run = ctx.run.lock().await;
        let collected: Map<String, Value> = if config.keys.is_empty() {
            run.state.clone()
        } else {
            config
                .keys
                .iter()
                .filter_map(|k| run.state.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        };
        let artifact = Value::Object(collected);
        run.set_state("artifact", artifact.clone());
        Ok(NodeExecution::completed(artifact, started))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::FlowContext;
    use serde_json::json;
    use std::sync::Arc;
    use stitchflow_types::pipeline::NodeDefinition;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn node_ctx(kind: NodeKind, config: Value, run: FlowContext) -> NodeContext {
        NodeContext {
            node: NodeDefinition {
                id: "boundary".to_string(),
                kind,
                config: config.clone(),
                retry: None,
                timeout_secs: None,
            },
            run: Arc::new(Mutex::new(run)),
            inputs: config,
            attempt: 1,
            step_index: None,
        }
    }

    fn run_ctx() -> FlowContext {
        let mut form = Map::new();
        form.insert("imageUrl".to_string(), json!("https://x/y.jpg"));
        FlowContext::new(Uuid::now_v7(), Uuid::now_v7(), "studio-42", form)
    }

    #[tokio::test]
    async fn test_input_passes_with_required_fields() {
        let ctx = node_ctx(NodeKind::Input, json!({ "fields": ["imageUrl"] }), run_ctx());
        let NodeExecution::Completed(success) = InputExecutor.execute(ctx).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(success.output["imageUrl"], json!("https://x/y.jpg"));
    }

    #[tokio::test]
    async fn test_input_missing_field_is_missing_input() {
        let ctx = node_ctx(
            NodeKind::Input,
            json!({ "fields": ["imageUrl", "garmentType"] }),
            run_ctx(),
        );
        let err = InputExecutor.execute(ctx).await.unwrap_err();
        assert_eq!(err.kind, stitchflow_types::error::ErrorKind::MissingInput);
    }

    #[tokio::test]
    async fn test_output_collects_named_keys() {
        let mut run = run_ctx();
        run.set_state("cutout", json!({ "url": "https://cdn/c.png" }));
        run.set_state("scratch", json!("ignored"));
        let ctx = node_ctx(NodeKind::Output, json!({ "keys": ["cutout"] }), run);
        let run_handle = Arc::clone(&ctx.run);

        let NodeExecution::Completed(success) = OutputExecutor.execute(ctx).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(success.output["cutout"]["url"], json!("https://cdn/c.png"));
        assert!(success.output.get("scratch").is_none());

        let run = run_handle.lock().await;
        assert_eq!(run.state["artifact"]["cutout"]["url"], json!("https://cdn/c.png"));
    }

    #[tokio::test]
    async fn test_output_with_no_keys_collects_all_state() {
        let mut run = run_ctx();
        run.set_state("a", json!(1));
        run.set_state("b", json!(2));
        let ctx = node_ctx(NodeKind::Output, json!({}), run);
        let NodeExecution::Completed(success) = OutputExecutor.execute(ctx).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(success.output["a"], json!(1));
        assert_eq!(success.output["b"], json!(2));
    }
}
