//! Structural node kinds: fork, join, loop.
//!
//! Fork and join traversal semantics derive from out/in-degree and live in
//! the engine; the explicit node kinds are accepted as markers so editors
//! can declare intent, and their executors only validate. Loop bodies are
//! nested sub-graphs executed by the engine with a fresh per-iteration
//! output cache, so the loop executor validates configuration and is never
//! dispatched directly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::{EdgeDefinition, JoinStrategy, NodeDefinition, NodeKind};

use super::{NodeContext, NodeExecution, NodeExecutor};
use crate::graph::compiler::is_async_provider;

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

/// Marker executor for explicit `fork` nodes.
pub struct ForkExecutor;

#[async_trait]
impl NodeExecutor for ForkExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Fork
    }

    fn validate(&self, _config: &Value) -> Result<(), NodeError> {
        Ok(())
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        // Fan-out happens in the engine from out-degree; the marker itself
        // is a pass-through.
        Ok(NodeExecution::completed(Value::Null, Instant::now()))
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct JoinConfig {
    #[serde(default)]
    #[allow(dead_code)]
    strategy: JoinStrategy,
}

/// Marker executor for explicit `join` nodes.
///
/// A resolved join is fed forward from the output cache; this executor only
/// runs for a join reached outside fork aggregation (a degenerate graph) and
/// passes through.
pub struct JoinExecutor;

#[async_trait]
impl NodeExecutor for JoinExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Join
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        serde_json::from_value::<JoinConfig>(config.clone())
            .map(|_| ())
            .map_err(|e| NodeError::invalid_config(format!("join config: {e}")))
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        Ok(NodeExecution::completed(Value::Null, Instant::now()))
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Nested sub-graph forming a loop body.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopBody {
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
}

fn default_max_iterations() -> u32 {
    10
}

/// Configuration of a `loop` node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Iteration bound; the loop never runs more than this many times.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Optional JEXL continue condition, checked before each iteration with
    /// `iteration` bound to the 0-based index.
    #[serde(default)]
    pub condition: Option<String>,
    /// The sub-graph executed per iteration.
    pub body: LoopBody,
}

/// Parse and check a loop configuration.
pub fn parse_loop_config(config: &Value) -> Result<LoopConfig, NodeError> {
    let config: LoopConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::invalid_config(format!("loop config: {e}")))?;
    if config.max_iterations == 0 {
        return Err(NodeError::invalid_config("'maxIterations' must be positive"));
    }
    if config.body.nodes.is_empty() {
        return Err(NodeError::invalid_config("loop body has no nodes"));
    }
    for node in &config.body.nodes {
        if is_async_provider(node) {
            return Err(NodeError::invalid_config(format!(
                "async provider node '{}' is not allowed inside a loop body",
                node.id
            )));
        }
    }
    Ok(config)
}

/// Validation-only executor for `loop` nodes; iteration runs in the engine.
pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Loop
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        parse_loop_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        Err(NodeError::internal(format!(
            "loop node '{}' dispatched outside the engine",
            ctx.node.id
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loop_config_defaults_and_bounds() {
        let config = parse_loop_config(&json!({
            "body": {
                "nodes": [{ "id": "t", "kind": "transform", "config": { "template": {} } }],
                "edges": []
            }
        }))
        .unwrap();
        assert_eq!(config.max_iterations, 10);
        assert!(config.condition.is_none());

        assert!(parse_loop_config(&json!({
            "maxIterations": 0,
            "body": {
                "nodes": [{ "id": "t", "kind": "transform", "config": { "template": {} } }],
                "edges": []
            }
        }))
        .is_err());
    }

    #[test]
    fn test_loop_body_must_have_nodes() {
        assert!(parse_loop_config(&json!({ "body": { "nodes": [], "edges": [] } })).is_err());
        assert!(parse_loop_config(&json!({})).is_err());
    }

    #[test]
    fn test_loop_body_rejects_async_provider() {
        let err = parse_loop_config(&json!({
            "body": {
                "nodes": [{
                    "id": "p",
                    "kind": "provider",
                    "config": { "providerRef": "matting-v2", "mode": "async" }
                }],
                "edges": []
            }
        }))
        .unwrap_err();
        assert_eq!(err.kind, stitchflow_types::error::ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_join_strategy_validation() {
        assert!(JoinExecutor.validate(&json!({ "strategy": "any" })).is_ok());
        assert!(JoinExecutor.validate(&json!({})).is_ok());
        assert!(JoinExecutor.validate(&json!({ "strategy": "most" })).is_err());
    }
}
