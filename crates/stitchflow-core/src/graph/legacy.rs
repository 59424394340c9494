//! Legacy linear pipeline normalization.
//!
//! Pipelines stored before the visual editor are plain JSON arrays of
//! provider steps. They normalize into a straight-line chain of async
//! provider nodes and compile through the same graph path as editor output,
//! so there is exactly one interpreter.

use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use stitchflow_types::pipeline::{
    EdgeDefinition, LegacyStep, NodeDefinition, NodeKind, PipelineDefinition, PipelineSettings,
    PipelineSource,
};

/// Normalize legacy steps into a straight-line pipeline definition.
///
/// Step `i` becomes node `step-<i>`; each node chains to the next. Legacy
/// steps always executed on external compute, so every node is an async
/// provider completing via callback. Cycle tolerance is enabled because the
/// chain shape cannot cycle and stored legacy payloads predate strict
/// validation.
pub fn normalize_legacy(steps: &[LegacyStep]) -> PipelineDefinition {
    let nodes: Vec<NodeDefinition> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| NodeDefinition {
            id: format!("step-{i}"),
            kind: NodeKind::Provider,
            config: json!({
                "providerRef": step.provider_ref,
                "mode": "async",
                "payload": step.config,
            }),
            retry: step.retry.clone(),
            timeout_secs: step.timeout_secs,
        })
        .collect();

    let edges: Vec<EdgeDefinition> = (1..steps.len())
        .map(|i| EdgeDefinition {
            id: None,
            source: format!("step-{}", i - 1),
            target: format!("step-{i}"),
            condition: None,
        })
        .collect();

    PipelineDefinition {
        id: Uuid::now_v7(),
        name: "legacy-pipeline".to_string(),
        nodes,
        edges,
        variables: HashMap::new(),
        settings: PipelineSettings {
            legacy_cycle_tolerance: true,
            ..PipelineSettings::default()
        },
    }
}

/// Convert either accepted input format into the canonical definition.
pub fn into_definition(source: PipelineSource) -> PipelineDefinition {
    match source {
        PipelineSource::Graph(def) => def,
        PipelineSource::Legacy(steps) => normalize_legacy(&steps),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compiler::{compile, is_async_provider};
    use serde_json::json;

    fn legacy_steps() -> Vec<LegacyStep> {
        serde_json::from_value(json!([
            { "providerRef": "resize-v1", "config": { "width": 1024 }, "timeoutSecs": 60 },
            { "providerRef": "matting-v2", "config": { "trim": true } },
            { "providerRef": "relight-v1" }
        ]))
        .unwrap()
    }

    #[test]
    fn test_normalize_builds_straight_chain() {
        let def = normalize_legacy(&legacy_steps());
        assert_eq!(def.nodes.len(), 3);
        assert_eq!(def.edges.len(), 2);
        assert_eq!(def.nodes[0].id, "step-0");
        assert_eq!(def.edges[0].source, "step-0");
        assert_eq!(def.edges[0].target, "step-1");
        assert_eq!(def.edges[1].target, "step-2");
        assert!(def.settings.legacy_cycle_tolerance);
    }

    #[test]
    fn test_normalized_steps_are_async_providers() {
        let def = normalize_legacy(&legacy_steps());
        for node in &def.nodes {
            assert_eq!(node.kind, NodeKind::Provider);
            assert!(is_async_provider(node));
        }
        assert_eq!(
            def.nodes[0].config["payload"]["width"],
            json!(1024),
            "step config carries through as the provider payload"
        );
        assert_eq!(def.nodes[0].timeout_secs, Some(60));
    }

    #[test]
    fn test_normalized_chain_compiles_with_sequential_step_indices() {
        let def = normalize_legacy(&legacy_steps());
        let graph = compile(&def).unwrap();
        assert_eq!(graph.entry, "step-0");
        assert_eq!(graph.async_steps["step-0"], 0);
        assert_eq!(graph.async_steps["step-1"], 1);
        assert_eq!(graph.async_steps["step-2"], 2);
        assert_eq!(graph.total_async_steps(), 3);
    }

    #[test]
    fn test_single_step_pipeline() {
        let steps: Vec<LegacyStep> =
            serde_json::from_value(json!([{ "providerRef": "resize-v1" }])).unwrap();
        let def = normalize_legacy(&steps);
        assert_eq!(def.nodes.len(), 1);
        assert!(def.edges.is_empty());
        assert!(compile(&def).is_ok());
    }
}
