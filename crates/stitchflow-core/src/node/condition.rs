//! Condition node executor.
//!
//! A condition node evaluates one JEXL expression against the run context
//! and outputs `{ "result": bool }`. The engine then selects the matching
//! outgoing edge -- condition nodes pick exactly one successor and never
//! fork. Branching lives here, not in templates.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::NodeKind;

use super::{NodeContext, NodeExecution, NodeExecutor};
use crate::engine::expression::ConditionEvaluator;

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    expression: String,
}

fn parse_config(config: &Value) -> Result<ConditionConfig, NodeError> {
    let config: ConditionConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::invalid_config(format!("condition config: {e}")))?;
    if config.expression.is_empty() {
        return Err(NodeError::invalid_config("condition nodes require 'expression'"));
    }
    Ok(config)
}

/// Executor for `condition` nodes.
pub struct ConditionExecutor {
    evaluator: Arc<ConditionEvaluator>,
}

impl ConditionExecutor {
    pub fn new(evaluator: Arc<ConditionEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        // Parse from raw node config: the expression is evaluated against a
        // context object, never resolved as a template.
        let config = parse_config(&ctx.node.config)?;

        let context = {
            let run = ctx.run.lock().await;
            run.expression_context()
        };

        let result = self
            .evaluator
            .evaluate_bool(&config.expression, &context)
            .map_err(|e| NodeError::execution_failed(format!("condition evaluation: {e}")))?;

        Ok(NodeExecution::completed(json!({ "result": result }), started))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::FlowContext;
    use serde_json::Map;
    use stitchflow_types::pipeline::NodeDefinition;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn node_ctx(expression: &str, form: Value) -> NodeContext {
        let config = json!({ "expression": expression });
        let form_map: Map<String, Value> = form.as_object().cloned().unwrap_or_default();
        NodeContext {
            node: NodeDefinition {
                id: "check".to_string(),
                kind: NodeKind::Condition,
                config: config.clone(),
                retry: None,
                timeout_secs: None,
            },
            run: Arc::new(Mutex::new(FlowContext::new(
                Uuid::now_v7(),
                Uuid::now_v7(),
                "studio-42",
                form_map,
            ))),
            inputs: config,
            attempt: 1,
            step_index: None,
        }
    }

    fn executor() -> ConditionExecutor {
        ConditionExecutor::new(Arc::new(ConditionEvaluator::new()))
    }

    #[test]
    fn test_validate_requires_expression() {
        let exec = executor();
        assert!(exec.validate(&json!({ "expression": "form.ok" })).is_ok());
        assert!(exec.validate(&json!({})).is_err());
        assert!(exec.validate(&json!({ "expression": "" })).is_err());
    }

    #[tokio::test]
    async fn test_true_and_false_results() {
        let exec = executor();

        let execution = exec
            .execute(node_ctx("form.garmentType == 'blazer'", json!({ "garmentType": "blazer" })))
            .await
            .unwrap();
        let NodeExecution::Completed(success) = execution else {
            panic!("expected Completed");
        };
        assert_eq!(success.output, json!({ "result": true }));

        let execution = exec
            .execute(node_ctx("form.garmentType == 'dress'", json!({ "garmentType": "blazer" })))
            .await
            .unwrap();
        let NodeExecution::Completed(success) = execution else {
            panic!("expected Completed");
        };
        assert_eq!(success.output, json!({ "result": false }));
    }

    #[tokio::test]
    async fn test_eval_error_is_structured() {
        let exec = executor();
        let err = exec
            .execute(node_ctx("form.x ==", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, stitchflow_types::error::ErrorKind::ExecutionFailed);
    }
}
