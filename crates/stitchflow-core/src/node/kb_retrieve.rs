//! Knowledge-retrieval node executor and the retriever port.
//!
//! `kb_retrieve` nodes query the knowledge collaborator (styling guides,
//! garment care sheets, brand tone notes) and write the ranked hits plus
//! retrieval metadata into run state under a configurable key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use stitchflow_types::error::NodeError;
use stitchflow_types::pipeline::NodeKind;
use stitchflow_types::retrieval::{RetrievalHit, RetrievalQuery};

use super::{NodeContext, NodeExecution, NodeExecutor};

/// Port to the knowledge-retrieval collaborator. Implemented by infra.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>, NodeError>;
}

fn default_top_k() -> usize {
    5
}

fn default_output_key() -> String {
    "retrieval".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KbRetrieveConfig {
    query: String,
    #[serde(default)]
    kb_id: Option<String>,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    filters: HashMap<String, Value>,
    #[serde(default = "default_output_key")]
    output_key: String,
}

fn parse_config(config: &Value) -> Result<KbRetrieveConfig, NodeError> {
    let config: KbRetrieveConfig = serde_json::from_value(config.clone())
        .map_err(|e| NodeError::invalid_config(format!("kb_retrieve config: {e}")))?;
    if config.query.is_empty() {
        return Err(NodeError::invalid_config("kb_retrieve nodes require 'query'"));
    }
    Ok(config)
}

/// Executor for `kb_retrieve` nodes.
pub struct KbRetrieveExecutor {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl KbRetrieveExecutor {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl NodeExecutor for KbRetrieveExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::KbRetrieve
    }

    fn validate(&self, config: &Value) -> Result<(), NodeError> {
        parse_config(config).map(|_| ())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeExecution, NodeError> {
        let started = Instant::now();
        let config = parse_config(&ctx.inputs)?;

        let query = RetrievalQuery {
            query: config.query.clone(),
            kb_id: config.kb_id.clone(),
            top_k: config.top_k,
            filters: config.filters.clone(),
        };

        let hits = self.retriever.search(&query).await?;
        let count = hits.len();

        let output = json!({
            "hits": hits,
            "metadata": {
                "query": config.query,
                "kbId": config.kb_id,
                "topK": config.top_k,
                "count": count,
            }
        });

        {
            let mut run = ctx.run.lock().await;
            run.set_state(&config.output_key, output.clone());
        }

        tracing::debug!(
            node_id = ctx.node.id.as_str(),
            hits = count,
            output_key = config.output_key.as_str(),
            "retrieval complete"
        );

        Ok(NodeExecution::completed(output, started))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
