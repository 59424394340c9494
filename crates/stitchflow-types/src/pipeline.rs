//! Pipeline definition types for Stitchflow.
//!
//! Defines the canonical intermediate representation for processing
//! pipelines: the visual editor's graph JSON and the legacy linear `steps[]`
//! format both convert to `PipelineDefinition`, which is the single source
//! of truth for a pipeline's shape. Definitions are immutable once
//! published; many runs reference one definition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Pipeline Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// UUIDv7 assigned on first publish.
    pub id: Uuid,
    /// Human-readable pipeline name.
    #[serde(default)]
    pub name: String,
    /// Node definitions forming the pipeline DAG.
    pub nodes: Vec<NodeDefinition>,
    /// Directed edges between nodes.
    pub edges: Vec<EdgeDefinition>,
    /// Author-declared pipeline variables (seed values for `form.*`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    /// Execution settings.
    #[serde(default)]
    pub settings: PipelineSettings,
}

/// A single node in the pipeline DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Author-assigned node ID (e.g. "remove-background"). Unique per pipeline.
    pub id: String,
    /// The kind of node.
    pub kind: NodeKind,
    /// Kind-specific configuration payload. Validated by the matching
    /// executor's pre-flight check.
    #[serde(default)]
    pub config: Value,
    /// Retry policy for this node. Absent means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Node-level timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// The kind of a pipeline node.
///
/// Closed enum: adding a kind adds a variant plus one executor registration,
/// never an edit to a dispatch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// External service call, synchronous or asynchronous (callback-completed).
    Provider,
    /// Knowledge-base retrieval writing ranked hits into run state.
    KbRetrieve,
    /// Boolean edge selector; chooses exactly one outgoing edge.
    Condition,
    /// Pure data shaping through the variable resolver.
    Transform,
    /// Structural fan-out marker. Fork semantics derive from out-degree.
    Fork,
    /// Structural fan-in marker. Join semantics derive from in-degree.
    Join,
    /// Bounded per-iteration sub-graph execution.
    Loop,
    /// Entry boundary marker seeding caller inputs.
    Input,
    /// Exit boundary marker collecting the run artifact.
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Provider => "provider",
            NodeKind::KbRetrieve => "kb_retrieve",
            NodeKind::Condition => "condition",
            NodeKind::Transform => "transform",
            NodeKind::Fork => "fork",
            NodeKind::Join => "join",
            NodeKind::Loop => "loop",
            NodeKind::Input => "input",
            NodeKind::Output => "output",
        }
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Optional editor-assigned edge ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Source node ID.
    pub source: String,
    /// Target node ID.
    pub target: String,
    /// Optional JEXL guard; the edge is taken only when it evaluates truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry policy for a pipeline node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds (default 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Backoff curve applied to the base delay.
    #[serde(default)]
    pub backoff: Backoff,
    /// Error kinds eligible for retry. Kinds not listed fail immediately.
    #[serde(default)]
    pub retryable_errors: Vec<ErrorKind>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Backoff curve for retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// delay * attempt
    #[default]
    Linear,
    /// delay * 2^(attempt - 1)
    Exponential,
}

// ---------------------------------------------------------------------------
// Join strategy
// ---------------------------------------------------------------------------

/// How a join node aggregates settled branch outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Fails if any registered branch failed; aggregates all outputs.
    #[default]
    All,
    /// Succeeds if at least one branch succeeded; aggregates the survivors.
    Any,
    /// Takes the earliest success in completion order, discarding (not
    /// cancelling) the rest.
    First,
}

// ---------------------------------------------------------------------------
// Pipeline settings
// ---------------------------------------------------------------------------

/// Pipeline-level execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Policy applied when a node exhausts its retries.
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Downgrade compile-time cycle detection from a hard failure to a
    /// recorded warning. Exists for stored legacy pipelines only.
    #[serde(default)]
    pub legacy_cycle_tolerance: bool,
    /// Pipeline-level timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// What the run does after a node fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Fail the run immediately.
    #[default]
    Stop,
    /// Record the failure and keep walking.
    Continue,
    /// Fail the run and record a compensation manifest of completed
    /// side-effecting nodes in run state.
    Rollback,
}

// ---------------------------------------------------------------------------
// Legacy linear format
// ---------------------------------------------------------------------------

/// One step of the legacy linear pipeline format.
///
/// Stored pipelines predating the visual editor are plain arrays of steps;
/// each step becomes a provider node in a straight-line chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStep {
    /// Step type tag. Only provider-style steps existed in the legacy format.
    #[serde(rename = "type", default)]
    pub step_type: Option<String>,
    /// External provider reference.
    pub provider_ref: String,
    /// Step payload forwarded to the provider.
    #[serde(default)]
    pub config: Value,
    /// Step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// The two accepted pipeline input formats.
#[derive(Debug, Clone)]
pub enum PipelineSource {
    /// Modern graph form: `{nodes, edges, ...}`.
    Graph(PipelineDefinition),
    /// Legacy linear form: a JSON array of steps.
    Legacy(Vec<LegacyStep>),
}

impl PipelineSource {
    /// Detect and parse a pipeline from raw JSON.
    ///
    /// A JSON array is the legacy linear format; an object carrying both
    /// `nodes` and `edges` is the graph format. Anything else is rejected.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        if value.is_array() {
            let steps: Vec<LegacyStep> = serde_json::from_value(value.clone())
                .map_err(|e| format!("invalid legacy steps: {e}"))?;
            return Ok(PipelineSource::Legacy(steps));
        }
        if value.get("nodes").is_some() && value.get("edges").is_some() {
            let def: PipelineDefinition = serde_json::from_value(value.clone())
                .map_err(|e| format!("invalid pipeline definition: {e}"))?;
            return Ok(PipelineSource::Graph(def));
        }
        Err("expected a step array or an object with 'nodes' and 'edges'".to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a full definition exercising several node kinds.
    fn sample_pipeline() -> PipelineDefinition {
        PipelineDefinition {
            id: Uuid::now_v7(),
            name: "garment-retouch".to_string(),
            nodes: vec![
                NodeDefinition {
                    id: "intake".to_string(),
                    kind: NodeKind::Input,
                    config: json!({ "fields": ["imageUrl", "garmentType"] }),
                    retry: None,
                    timeout_secs: None,
                },
                NodeDefinition {
                    id: "remove-background".to_string(),
                    kind: NodeKind::Provider,
                    config: json!({
                        "providerRef": "matting-v2",
                        "mode": "async",
                        "payload": { "image": "{{form.imageUrl}}" }
                    }),
                    retry: Some(RetryPolicy {
                        max_retries: 2,
                        retry_delay_ms: 500,
                        backoff: Backoff::Exponential,
                        retryable_errors: vec![ErrorKind::ProviderError, ErrorKind::Timeout],
                    }),
                    timeout_secs: Some(120),
                },
                NodeDefinition {
                    id: "style-notes".to_string(),
                    kind: NodeKind::KbRetrieve,
                    config: json!({
                        "query": "{{form.garmentType}} styling",
                        "topK": 3,
                        "outputKey": "styleNotes"
                    }),
                    retry: None,
                    timeout_secs: None,
                },
                NodeDefinition {
                    id: "deliver".to_string(),
                    kind: NodeKind::Output,
                    config: json!({ "keys": ["styleNotes"] }),
                    retry: None,
                    timeout_secs: None,
                },
            ],
            edges: vec![
                EdgeDefinition {
                    id: None,
                    source: "intake".to_string(),
                    target: "remove-background".to_string(),
                    condition: None,
                },
                EdgeDefinition {
                    id: None,
                    source: "intake".to_string(),
                    target: "style-notes".to_string(),
                    condition: None,
                },
                EdgeDefinition {
                    id: None,
                    source: "remove-background".to_string(),
                    target: "deliver".to_string(),
                    condition: None,
                },
                EdgeDefinition {
                    id: None,
                    source: "style-notes".to_string(),
                    target: "deliver".to_string(),
                    condition: None,
                },
            ],
            variables: HashMap::new(),
            settings: PipelineSettings::default(),
        }
    }

    // -----------------------------------------------------------------------
    // JSON roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_pipeline_definition_json_roundtrip() {
        let original = sample_pipeline();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: PipelineDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.nodes.len(), original.nodes.len());
        assert_eq!(parsed.edges.len(), original.edges.len());
    }

    #[test]
    fn test_node_kind_wire_names() {
        let json = serde_json::to_string(&NodeKind::KbRetrieve).unwrap();
        assert_eq!(json, "\"kb_retrieve\"");
        let parsed: NodeKind = serde_json::from_str("\"provider\"").unwrap();
        assert_eq!(parsed, NodeKind::Provider);
    }

    // -----------------------------------------------------------------------
    // Retry policy defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay_ms, 1000);
        assert_eq!(policy.backoff, Backoff::Linear);
        assert!(policy.retryable_errors.is_empty());
    }

    #[test]
    fn test_retry_policy_wire_format() {
        let json = r#"{
            "maxRetries": 2,
            "retryDelayMs": 250,
            "backoff": "exponential",
            "retryableErrors": ["PROVIDER_ERROR", "TIMEOUT"]
        }"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(
            policy.retryable_errors,
            vec![ErrorKind::ProviderError, ErrorKind::Timeout]
        );
    }

    // -----------------------------------------------------------------------
    // Join strategy / settings defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_join_strategy_default_is_all() {
        assert_eq!(JoinStrategy::default(), JoinStrategy::All);
        let parsed: JoinStrategy = serde_json::from_str("\"first\"").unwrap();
        assert_eq!(parsed, JoinStrategy::First);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: PipelineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.error_handling, ErrorHandling::Stop);
        assert!(!settings.legacy_cycle_tolerance);
        assert!(settings.timeout_secs.is_none());
    }

    // -----------------------------------------------------------------------
    // Format detection
    // -----------------------------------------------------------------------

    #[test]
    fn test_format_detection_legacy_array() {
        let value = json!([
            { "providerRef": "resize-v1", "timeoutSecs": 30 },
            { "providerRef": "matting-v2" }
        ]);
        match PipelineSource::from_value(&value).unwrap() {
            PipelineSource::Legacy(steps) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].provider_ref, "resize-v1");
                assert_eq!(steps[0].timeout_secs, Some(30));
            }
            PipelineSource::Graph(_) => panic!("expected legacy format"),
        }
    }

    #[test]
    fn test_format_detection_graph_object() {
        let value = serde_json::to_value(sample_pipeline()).unwrap();
        assert!(matches!(
            PipelineSource::from_value(&value).unwrap(),
            PipelineSource::Graph(_)
        ));
    }

    #[test]
    fn test_format_detection_rejects_other_shapes() {
        assert!(PipelineSource::from_value(&json!({"steps": []})).is_err());
        assert!(PipelineSource::from_value(&json!("nope")).is_err());
    }
}
