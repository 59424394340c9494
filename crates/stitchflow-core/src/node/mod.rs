//! Node executor contract and registry.
//!
//! Each node kind has exactly one executor implementing [`NodeExecutor`]:
//! `validate` is a cheap synchronous pre-flight over raw configuration, and
//! `execute` runs the node against the resolved inputs. Executors return
//! structured [`NodeError`]s -- never panics across the boundary -- so the
//! engine owns all retry-vs-fail decisions uniformly. The only executor
//! side-effect channel is writing to the run's state map.
//!
//! Dispatch is a closed table over [`NodeKind`]: adding a kind adds a
//! variant plus one registration, never an edit to the dispatcher.

pub mod boundary;
pub mod condition;
pub mod kb_retrieve;
pub mod provider;
pub mod structural;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::{NodeDefinition, NodeKind};

use crate::engine::context::FlowContext;
use crate::engine::expression::ConditionEvaluator;

pub use kb_retrieve::KnowledgeRetriever;
pub use provider::{ProviderClient, ProviderRequest, ProviderSubmission};

// ---------------------------------------------------------------------------
// Execution envelope
// ---------------------------------------------------------------------------

/// Successful node execution.
#[derive(Debug, Clone)]
pub struct NodeSuccess {
    /// Output fed into the run's node output cache.
    pub output: Value,
    /// Optional executor metadata (provider latency, hit counts, ...).
    pub metadata: Option<Value>,
    /// Wall-clock execution time.
    pub duration: Duration,
}

/// Work handed to external compute; the node completes later via callback.
#[derive(Debug, Clone)]
pub struct PendingStep {
    /// Step index assigned at compile time; callback correlation key.
    pub step_index: u32,
    /// External provider service reference.
    pub provider_ref: String,
    /// Reference assigned by the provider at submission, if any.
    pub provider_task_ref: Option<String>,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone)]
pub enum NodeExecution {
    Completed(NodeSuccess),
    Suspended(PendingStep),
}

impl NodeExecution {
    /// Completed outcome with the duration measured from `started`.
    pub fn completed(output: Value, started: std::time::Instant) -> Self {
        NodeExecution::Completed(NodeSuccess {
            output,
            metadata: None,
            duration: started.elapsed(),
        })
    }

    pub fn completed_with_metadata(
        output: Value,
        metadata: Value,
        started: std::time::Instant,
    ) -> Self {
        NodeExecution::Completed(NodeSuccess {
            output,
            metadata: Some(metadata),
            duration: started.elapsed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Everything an executor sees for one dispatch.
pub struct NodeContext {
    /// The node definition being executed.
    pub node: NodeDefinition,
    /// The run's mutable context (state map, output cache).
    pub run: Arc<Mutex<FlowContext>>,
    /// Node configuration after variable resolution.
    pub inputs: Value,
    /// 1-based attempt number (increments on retry).
    pub attempt: u32,
    /// Compile-time step index for async provider nodes.
    pub step_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// Contract every node kind implements.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The node kind this executor serves.
    fn kind(&self) -> NodeKind;

    /// Cheap synchronous pre-flight over raw (unresolved) configuration.
    fn validate(&self, config: &Value) -> Result<(), NodeError>;

    /// Execute the node. Failures are structured errors, never panics.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Closed dispatch table: one executor per node kind.
pub struct NodeRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    /// Registry with all built-in executors wired to the given collaborators.
    pub fn with_builtins(
        provider: Arc<dyn ProviderClient>,
        retriever: Arc<dyn KnowledgeRetriever>,
        evaluator: Arc<ConditionEvaluator>,
    ) -> Self {
        let mut registry = Self {
            executors: HashMap::new(),
        };
        registry.register(Arc::new(provider::ProviderExecutor::new(provider)));
        registry.register(Arc::new(kb_retrieve::KbRetrieveExecutor::new(retriever)));
        registry.register(Arc::new(condition::ConditionExecutor::new(evaluator)));
        registry.register(Arc::new(transform::TransformExecutor));
        registry.register(Arc::new(boundary::InputExecutor));
        registry.register(Arc::new(boundary::OutputExecutor));
        registry.register(Arc::new(structural::ForkExecutor));
        registry.register(Arc::new(structural::JoinExecutor));
        registry.register(Arc::new(structural::LoopExecutor));
        registry
    }

    /// Register (or replace) the executor for its kind.
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&kind).cloned()
    }

    /// Pre-flight a node definition through its executor.
    pub fn validate(&self, node: &NodeDefinition) -> Result<(), NodeError> {
        let executor = self.executors.get(&node.kind).ok_or_else(|| {
            NodeError::invalid_config(format!("no executor registered for kind '{}'", node.kind.as_str()))
        })?;
        executor.validate(&node.config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stitchflow_types::retrieval::{RetrievalHit, RetrievalQuery};

    struct NullProvider;

    #[async_trait]
    impl ProviderClient for NullProvider {
        async fn invoke(&self, _request: &ProviderRequest) -> Result<Value, NodeError> {
            Ok(Value::Null)
        }

        async fn submit(&self, _request: &ProviderRequest) -> Result<ProviderSubmission, NodeError> {
            Ok(ProviderSubmission {
                provider_task_ref: None,
            })
        }
    }

    struct NullRetriever;

    #[async_trait]
    impl KnowledgeRetriever for NullRetriever {
        async fn search(&self, _query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, NodeError> {
            Ok(vec![])
        }
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins(
            Arc::new(NullProvider),
            Arc::new(NullRetriever),
            Arc::new(ConditionEvaluator::new()),
        )
    }

    #[test]
    fn test_builtins_cover_every_kind() {
        let registry = registry();
        for kind in [
            NodeKind::Provider,
            NodeKind::KbRetrieve,
            NodeKind::Condition,
            NodeKind::Transform,
            NodeKind::Fork,
            NodeKind::Join,
            NodeKind::Loop,
            NodeKind::Input,
            NodeKind::Output,
        ] {
            assert!(registry.get(kind).is_some(), "missing executor for {kind:?}");
        }
    }

    #[test]
    fn test_validate_dispatches_by_kind() {
        let registry = registry();
        let good = NodeDefinition {
            id: "p".to_string(),
            kind: NodeKind::Provider,
            config: json!({ "providerRef": "matting-v2" }),
            retry: None,
            timeout_secs: None,
        };
        assert!(registry.validate(&good).is_ok());

        let bad = NodeDefinition {
            config: json!({}),
            ..good
        };
        assert!(registry.validate(&bad).is_err());
    }
}
