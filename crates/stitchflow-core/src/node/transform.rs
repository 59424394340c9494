//! Transform node executor: pure data shaping between nodes.
//!
//! Two modes, combinable: `template` emits an arbitrary JSON tree whose
//! string leaves were already substituted by the resolver, and `pick`
//! projects dotted paths from the resolution scopes into a flat object.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::NodeKind;

use super::{NodeContext, NodeExecution, NodeExecutor};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformConfig {
    #[serde(default)]
    template: Option<Value>,
    #[serde(default)]
    pick: Option<Vec<String>>,
    #[serde(default)]
    output_key: Option<String>,
}

fn parse_config(config: &Value) -> Result<TransformConfig, NodeError> {
    let config: TransformConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::invalid_config(format!("transform config: {e}")))?;
    if config.template.is_none() && config.pick.is_none() {
        return Err(NodeError::invalid_config(
            "transform nodes require 'template' or 'pick'",
        ));
    }
    Ok(config)
}

/// Executor for `transform` nodes.
pub struct TransformExecutor;

#[async_trait]
impl NodeExecutor for TransformExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        // `inputs` is the config after resolution, so the template's
        // placeholders are already substituted.
        let config = parse_config(&ctx.inputs)?;

        let output = match (&config.template, &config.pick) {
            (Some(template), None) => template.clone(),
            (template, Some(paths)) => {
                let run = ctx.run.lock().await;
                let resolution = run.resolution_context();
                let mut picked = Map::new();
                for path in paths {
                    let leaf = path.rsplit('.').next().unwrap_or(path).to_string();
                    picked.insert(leaf, resolution.lookup(path).unwrap_or(Value::Null));
                }
                match template {
                    Some(Value::Object(base)) => {
                        let mut merged = base.clone();
                        merged.extend(picked);
                        Value::Object(merged)
                    }
                    _ => Value::Object(picked),
                }
            }
            // parse_config rejects this shape; kept as a structured error so
            // nothing panics across the executor boundary.
            (None, None) => {
                return Err(NodeError::invalid_config(
                    "transform nodes require 'template' or 'pick'",
                ));
            }
        };

        if let Some(key) = &config.output_key {
            let mut run = ctx.run.lock().await;
            run.set_state(key, output.clone());
        }

        Ok(NodeExecution::completed(output, started))
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

    fn node_ctx(inputs: Value, run: FlowContext) -> NodeContext {
        NodeContext {
            node: NodeDefinition {
                id: "shape".to_string(),
                kind: NodeKind::Transform,
                config: inputs.clone(),
                retry: None,
                timeout_secs: None,
            },
            run: Arc::new(Mutex::new(run)),
            inputs,
            attempt: 1,
            step_index: None,
        }
    }

    fn run_with_output() -> FlowContext {
        let mut form = Map::new();
        form.insert("garmentType".to_string(), json!("blazer"));
        let mut ctx = FlowContext::new(Uuid::now_v7(), Uuid::now_v7(), "studio-42", form);
        ctx.set_output("resize", json!({ "width": 1024, "url": "https://cdn/r.png" }));
        ctx
    }

    #[test]
    fn test_validate_requires_template_or_pick() {
        let exec = TransformExecutor;
        assert!(exec.validate(&json!({ "template": {} })).is_ok());
        assert!(exec.validate(&json!({ "pick": ["form.garmentType"] })).is_ok());
        assert!(exec.validate(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_template_passthrough() {
        let exec = TransformExecutor;
        // Engine-resolved inputs: placeholders already substituted.
        let ctx = node_ctx(
            json!({ "template": { "image": "https://x/y.jpg", "sizes": [512, 1024] } }),
            run_with_output(),
        );
        let NodeExecution::Completed(success) = exec.execute(ctx).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(success.output["sizes"], json!([512, 1024]));
    }

    #[tokio::test]
    async fn test_pick_projects_dotted_paths() {
        let exec = TransformExecutor;
        let ctx = node_ctx(
            json!({ "pick": ["resize.width", "form.garmentType", "resize.missing"] }),
            run_with_output(),
        );
        let NodeExecution::Completed(success) = exec.execute(ctx).await.unwrap() else {
            panic!("expected Completed");
        };
        assert_eq!(success.output["width"], json!(1024));
        assert_eq!(success.output["garmentType"], json!("blazer"));
        assert_eq!(success.output["missing"], json!(null));
    }

    #[tokio::test]
    async fn test_output_key_writes_state() {
        let exec = TransformExecutor;
        let ctx = node_ctx(
            json!({ "template": { "ok": true }, "outputKey": "shaped" }),
            run_with_output(),
        );
        let run = Arc::clone(&ctx.run);
        exec.execute(ctx).await.unwrap();
        assert_eq!(run.lock().await.state["shaped"]["ok"], json!(true));
    }
}
