//! DAG compiler: adjacency construction, structural validation, and
//! fork/join inference.
//!
//! Compilation validates exactly one entry node, flags unreachable nodes as
//! warnings, checks per-kind required configuration, and detects cycles with
//! a visited-in-current-path walk. Cycles are a hard failure by default;
//! `settings.legacy_cycle_tolerance` downgrades a back edge to a recorded
//! warning for stored legacy pipelines. Fork membership (out-degree > 1,
//! condition nodes excluded) and join membership (in-degree > 1) are
//! inferred structurally, and async provider nodes receive step indices in
//! topological order so dispatched work can be reconciled by
//! `(task_id, step_index)`.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use stitchflow_types::pipeline::{
    EdgeDefinition, JoinStrategy, NodeDefinition, NodeKind, PipelineDefinition, PipelineSettings,
};

// ---------------------------------------------------------------------------
// Errors and warnings
// ---------------------------------------------------------------------------

/// Fatal compilation failures.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("pipeline has no nodes")]
    Empty,

    #[error("duplicate node id: '{0}'")]
    DuplicateNode(String),

    #[error("edge references unknown node: '{0}'")]
    UnknownNode(String),

    #[error("no entry node: every node has incoming edges")]
    NoEntry,

    #[error("multiple entry nodes: {0:?}")]
    MultipleEntries(Vec<String>),

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("node '{node_id}' configuration invalid: {message}")]
    InvalidConfig { node_id: String, message: String },
}

/// Non-fatal findings surfaced alongside a compiled graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileWarning {
    /// Node is not reachable from the entry node and will never execute.
    UnreachableNode(String),
    /// A back edge was ignored under `legacy_cycle_tolerance`.
    CycleTolerated { source: String, target: String },
}

impl std::fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileWarning::UnreachableNode(id) => {
                write!(f, "node '{id}' is unreachable from the entry node")
            }
            CompileWarning::CycleTolerated { source, target } => {
                write!(f, "ignoring back edge '{source}' -> '{target}'")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// Fork membership: the branch heads dispatched when the fork node settles.
#[derive(Debug, Clone)]
pub struct ForkInfo {
    pub branches: Vec<String>,
}

/// Join membership: the upstream node ids registered against the join and
/// the configured aggregation strategy.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub sources: Vec<String>,
    pub strategy: JoinStrategy,
}

#[derive(Debug, Deserialize)]
struct JoinNodeConfig {
    #[serde(default)]
    strategy: JoinStrategy,
}

/// The executable form of a pipeline definition.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub definition_id: Uuid,
    pub name: String,
    pub settings: PipelineSettings,
    /// Nodes indexed by id.
    pub nodes: HashMap<String, NodeDefinition>,
    /// Outgoing edges per node, in authored order.
    pub forward: HashMap<String, Vec<EdgeDefinition>>,
    /// Incoming source ids per node.
    pub reverse: HashMap<String, Vec<String>>,
    /// The single entry node (in-degree 0).
    pub entry: String,
    /// Inferred fork nodes.
    pub forks: HashMap<String, ForkInfo>,
    /// Inferred join nodes.
    pub joins: HashMap<String, JoinInfo>,
    /// Async provider nodes, id -> step index in topological order.
    pub async_steps: HashMap<String, u32>,
    /// Non-fatal findings.
    pub warnings: Vec<CompileWarning>,
}

impl CompiledGraph {
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn successors(&self, id: &str) -> &[EdgeDefinition] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.reverse.get(id).map(Vec::len).unwrap_or(0)
    }

    pub fn is_join(&self, id: &str) -> bool {
        self.joins.contains_key(id)
    }

    pub fn join_strategy(&self, id: &str) -> JoinStrategy {
        self.joins
            .get(id)
            .map(|j| j.strategy)
            .unwrap_or_default()
    }

    pub fn total_async_steps(&self) -> u32 {
        self.async_steps.len() as u32
    }
}

/// Whether a node is a provider node completing via external callback.
pub fn is_async_provider(node: &NodeDefinition) -> bool {
    node.kind == NodeKind::Provider
        && node
            .config
            .get("mode")
            .and_then(Value::as_str)
            .is_some_and(|m| m == "async")
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile a pipeline definition into an executable graph.
pub fn compile(def: &PipelineDefinition) -> Result<CompiledGraph, CompileError> {
    if def.nodes.is_empty() {
        return Err(CompileError::Empty);
    }

    // Node index, rejecting duplicates.
    let mut nodes: HashMap<String, NodeDefinition> = HashMap::with_capacity(def.nodes.len());
    for node in &def.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            return Err(CompileError::DuplicateNode(node.id.clone()));
        }
    }

    // Forward/reverse adjacency.
    let mut forward: HashMap<String, Vec<EdgeDefinition>> = HashMap::new();
    let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &def.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !nodes.contains_key(endpoint) {
                return Err(CompileError::UnknownNode(endpoint.clone()));
            }
        }
        forward
            .entry(edge.source.clone())
            .or_default()
            .push(edge.clone());
        reverse
            .entry(edge.target.clone())
            .or_default()
            .push(edge.source.clone());
    }

    // Exactly one entry node.
    let mut entries: Vec<String> = def
        .nodes
        .iter()
        .filter(|n| !reverse.contains_key(&n.id))
        .map(|n| n.id.clone())
        .collect();
    let entry = match entries.len() {
        0 => return Err(CompileError::NoEntry),
        1 => entries.remove(0),
        _ => return Err(CompileError::MultipleEntries(entries)),
    };

    // Per-kind required configuration.
    for node in &def.nodes {
        validate_node_config(node)?;
    }

    // Cycle detection with a visited-in-current-path set, plus reachability.
    let mut warnings = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut preorder: Vec<String> = Vec::new();
    let mut path: HashSet<String> = HashSet::new();
    detect_cycles(
        &entry,
        &forward,
        &mut visited,
        &mut preorder,
        &mut path,
        def.settings.legacy_cycle_tolerance,
        &mut warnings,
    )?;

    for node in &def.nodes {
        if !visited.contains(&node.id) {
            warnings.push(CompileWarning::UnreachableNode(node.id.clone()));
        }
    }

    // Fork/join inference. Condition nodes select a single edge and never
    // fork; join membership is pure in-degree.
    let mut forks = HashMap::new();
    let mut joins = HashMap::new();
    for node in &def.nodes {
        let out: Vec<String> = forward
            .get(&node.id)
            .map(|edges| edges.iter().map(|e| e.target.clone()).collect())
            .unwrap_or_default();
        if out.len() > 1 && node.kind != NodeKind::Condition {
            forks.insert(node.id.clone(), ForkInfo { branches: out });
        }
        let sources = reverse.get(&node.id).cloned().unwrap_or_default();
        if sources.len() > 1 {
            let strategy = serde_json::from_value::<JoinNodeConfig>(node.config.clone())
                .map(|c| c.strategy)
                .unwrap_or_default();
            joins.insert(node.id.clone(), JoinInfo { sources, strategy });
        }
    }

    // Async step indices in topological order. Under cycle tolerance the
    // toposort can fail; DFS preorder is the fallback ordering.
    let order = topological_order(def, &nodes).unwrap_or(preorder);
    let mut async_steps = HashMap::new();
    let mut next_index: u32 = 0;
    for id in &order {
        if let Some(node) = nodes.get(id) {
            if is_async_provider(node) {
                async_steps.insert(id.clone(), next_index);
                next_index += 1;
            }
        }
    }

    Ok(CompiledGraph {
        definition_id: def.id,
        name: def.name.clone(),
        settings: def.settings.clone(),
        nodes,
        forward,
        reverse,
        entry,
        forks,
        joins,
        async_steps,
        warnings,
    })
}

/// Depth-first cycle walk. A successor already on the current path is a back
/// edge: fatal by default, warn-and-skip under tolerance.
fn detect_cycles(
    current: &str,
    forward: &HashMap<String, Vec<EdgeDefinition>>,
    visited: &mut HashSet<String>,
    preorder: &mut Vec<String>,
    path: &mut HashSet<String>,
    tolerate: bool,
    warnings: &mut Vec<CompileWarning>,
) -> Result<(), CompileError> {
    if !visited.insert(current.to_string()) {
        return Ok(());
    }
    preorder.push(current.to_string());
    path.insert(current.to_string());

    if let Some(edges) = forward.get(current) {
        for edge in edges {
            if path.contains(&edge.target) {
                if tolerate {
                    warnings.push(CompileWarning::CycleTolerated {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                    });
                    continue;
                }
                return Err(CompileError::CycleDetected(edge.target.clone()));
            }
            detect_cycles(&edge.target, forward, visited, preorder, path, tolerate, warnings)?;
        }
    }

    path.remove(current);
    Ok(())
}

/// Topological ordering via petgraph. `None` when the graph still contains a
/// cycle (tolerated back edges are part of the edge list).
fn topological_order(
    def: &PipelineDefinition,
    nodes: &HashMap<String, NodeDefinition>,
) -> Option<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::with_capacity(nodes.len());
    for node in &def.nodes {
        indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }
    for edge in &def.edges {
        graph.add_edge(indices[edge.source.as_str()], indices[edge.target.as_str()], ());
    }
    let sorted = toposort(&graph, None).ok()?;
    Some(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

/// Cheap per-kind required-field checks, mirrored by each executor's own
/// pre-flight validation.
fn validate_node_config(node: &NodeDefinition) -> Result<(), CompileError> {
    let invalid = |message: String| CompileError::InvalidConfig {
        node_id: node.id.clone(),
        message,
    };

    match node.kind {
        NodeKind::Provider => {
            let provider_ref = node
                .config
                .get("providerRef")
                .and_then(Value::as_str)
                .unwrap_or("");
            if provider_ref.is_empty() {
                return Err(invalid("provider nodes require 'providerRef'".to_string()));
            }
            if let Some(mode) = node.config.get("mode").and_then(Value::as_str) {
                if mode != "sync" && mode != "async" {
                    return Err(invalid(format!("unknown provider mode '{mode}'")));
                }
            }
        }
        NodeKind::KbRetrieve => {
            if node
                .config
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or("")
                .is_empty()
            {
                return Err(invalid("kb_retrieve nodes require 'query'".to_string()));
            }
        }
        NodeKind::Condition => {
            if node
                .config
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or("")
                .is_empty()
            {
                return Err(invalid("condition nodes require 'expression'".to_string()));
            }
        }
        NodeKind::Transform => {
            if node.config.get("template").is_none() && node.config.get("pick").is_none() {
                return Err(invalid(
                    "transform nodes require 'template' or 'pick'".to_string(),
                ));
            }
        }
        NodeKind::Loop => {
            let body = node
                .config
                .get("body")
                .ok_or_else(|| invalid("loop nodes require a 'body' sub-graph".to_string()))?;
            let body_nodes: Vec<NodeDefinition> = body
                .get("nodes")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| invalid(format!("invalid loop body nodes: {e}")))?
                .ok_or_else(|| invalid("loop body requires 'nodes'".to_string()))?;
            if body.get("edges").is_none() {
                return Err(invalid("loop body requires 'edges'".to_string()));
            }
            for inner in &body_nodes {
                if is_async_provider(inner) {
                    return Err(invalid(format!(
                        "async provider node '{}' is not allowed inside a loop body",
                        inner.id
                    )));
                }
            }
            if let Some(max) = node.config.get("maxIterations") {
                if max.as_u64().is_none_or(|m| m == 0) {
                    return Err(invalid("'maxIterations' must be a positive integer".to_string()));
                }
            }
        }
        NodeKind::Join => {
            if node.config.get("strategy").is_some() {
                serde_json::from_value::<JoinNodeConfig>(node.config.clone())
                    .map_err(|e| invalid(format!("invalid join strategy: {e}")))?;
            }
        }
        NodeKind::Fork | NodeKind::Input | NodeKind::Output => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn node(id: &str, kind: NodeKind, config: Value) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            kind,
            config,
            retry: None,
            timeout_secs: None,
        }
    }

    fn transform(id: &str) -> NodeDefinition {
        node(id, NodeKind::Transform, json!({ "template": { "from": id } }))
    }

    fn edge(source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            id: None,
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    fn pipeline(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            id: Uuid::now_v7(),
            name: "test".to_string(),
            nodes,
            edges,
            variables: StdHashMap::new(),
            settings: PipelineSettings::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    #[test]
    fn test_linear_chain_compiles() {
        let def = pipeline(
            vec![transform("a"), transform("b"), transform("c")],
            vec![edge("a", "b"), edge("b", "c")],
        );
        let graph = compile(&def).unwrap();
        assert_eq!(graph.entry, "a");
        assert_eq!(graph.successors("a")[0].target, "b");
        assert!(graph.forks.is_empty());
        assert!(graph.joins.is_empty());
        assert!(graph.warnings.is_empty());
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let def = pipeline(vec![], vec![]);
        assert!(matches!(compile(&def), Err(CompileError::Empty)));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let def = pipeline(vec![transform("a"), transform("a")], vec![]);
        assert!(matches!(compile(&def), Err(CompileError::DuplicateNode(_))));
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let def = pipeline(vec![transform("a")], vec![edge("a", "ghost")]);
        assert!(matches!(compile(&def), Err(CompileError::UnknownNode(_))));
    }

    #[test]
    fn test_multiple_entries_rejected() {
        let def = pipeline(
            vec![transform("a"), transform("b"), transform("c")],
            vec![edge("a", "c"), edge("b", "c")],
        );
        match compile(&def) {
            Err(CompileError::MultipleEntries(ids)) => assert_eq!(ids.len(), 2),
            other => panic!("expected MultipleEntries, got {other:?}"),
        }
    }

    #[test]
    fn test_no_entry_rejected() {
        // Pure 2-cycle: every node has an incoming edge.
        let def = pipeline(
            vec![transform("a"), transform("b")],
            vec![edge("a", "b"), edge("b", "a")],
        );
        assert!(matches!(compile(&def), Err(CompileError::NoEntry)));
    }

    // -----------------------------------------------------------------------
    // Cycles
    // -----------------------------------------------------------------------

    #[test]
    fn test_cycle_is_fatal_by_default() {
        let def = pipeline(
            vec![transform("a"), transform("b"), transform("c")],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        );
        assert!(matches!(compile(&def), Err(CompileError::CycleDetected(_))));
    }

    #[test]
    fn test_cycle_tolerated_under_legacy_flag() {
        let mut def = pipeline(
            vec![transform("a"), transform("b"), transform("c")],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        );
        def.settings.legacy_cycle_tolerance = true;
        let graph = compile(&def).unwrap();
        assert!(graph
            .warnings
            .iter()
            .any(|w| matches!(w, CompileWarning::CycleTolerated { .. })));
    }

    // -----------------------------------------------------------------------
    // Reachability
    // -----------------------------------------------------------------------

    #[test]
    fn test_unreachable_node_warns_but_compiles() {
        // c and d form a detached cycle: both have incoming edges, so "a" is
        // still the single entry, but neither is reachable from it.
        let def = pipeline(
            vec![transform("a"), transform("b"), transform("c"), transform("d")],
            vec![edge("a", "b"), edge("c", "d"), edge("d", "c")],
        );
        let graph = compile(&def).unwrap();
        assert!(graph
            .warnings
            .contains(&CompileWarning::UnreachableNode("c".to_string())));
        assert!(graph
            .warnings
            .contains(&CompileWarning::UnreachableNode("d".to_string())));
    }

    // -----------------------------------------------------------------------
    // Fork/join inference
    // -----------------------------------------------------------------------

    #[test]
    fn test_fork_and_join_inferred_from_degree() {
        let def = pipeline(
            vec![
                transform("start"),
                transform("a"),
                transform("b"),
                node("merge", NodeKind::Join, json!({ "strategy": "any" })),
            ],
            vec![
                edge("start", "a"),
                edge("start", "b"),
                edge("a", "merge"),
                edge("b", "merge"),
            ],
        );
        let graph = compile(&def).unwrap();
        assert_eq!(graph.forks["start"].branches, vec!["a", "b"]);
        assert_eq!(graph.joins["merge"].sources.len(), 2);
        assert_eq!(graph.join_strategy("merge"), JoinStrategy::Any);
        assert_eq!(graph.join_strategy("a"), JoinStrategy::All, "default for non-joins");
    }

    #[test]
    fn test_condition_node_is_not_a_fork() {
        let def = pipeline(
            vec![
                node("check", NodeKind::Condition, json!({ "expression": "form.ok" })),
                transform("yes"),
                transform("no"),
            ],
            vec![edge("check", "yes"), edge("check", "no")],
        );
        let graph = compile(&def).unwrap();
        assert!(graph.forks.is_empty());
    }

    // -----------------------------------------------------------------------
    // Per-kind validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_provider_without_ref_rejected() {
        let def = pipeline(
            vec![node("p", NodeKind::Provider, json!({ "mode": "sync" }))],
            vec![],
        );
        match compile(&def) {
            Err(CompileError::InvalidConfig { node_id, .. }) => assert_eq!(node_id, "p"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_provider_with_bad_mode_rejected() {
        let def = pipeline(
            vec![node(
                "p",
                NodeKind::Provider,
                json!({ "providerRef": "matting-v2", "mode": "later" }),
            )],
            vec![],
        );
        assert!(matches!(compile(&def), Err(CompileError::InvalidConfig { .. })));
    }

    #[test]
    fn test_loop_body_rejects_async_provider() {
        let def = pipeline(
            vec![node(
                "l",
                NodeKind::Loop,
                json!({
                    "maxIterations": 3,
                    "body": {
                        "nodes": [{
                            "id": "inner",
                            "kind": "provider",
                            "config": { "providerRef": "x", "mode": "async" }
                        }],
                        "edges": []
                    }
                }),
            )],
            vec![],
        );
        assert!(matches!(compile(&def), Err(CompileError::InvalidConfig { .. })));
    }

    // -----------------------------------------------------------------------
    // Async step indexing
    // -----------------------------------------------------------------------

    #[test]
    fn test_async_steps_indexed_in_topological_order() {
        let def = pipeline(
            vec![
                node(
                    "first",
                    NodeKind::Provider,
                    json!({ "providerRef": "resize-v1", "mode": "async" }),
                ),
                transform("mid"),
                node(
                    "second",
                    NodeKind::Provider,
                    json!({ "providerRef": "matting-v2", "mode": "async" }),
                ),
            ],
            vec![edge("first", "mid"), edge("mid", "second")],
        );
        let graph = compile(&def).unwrap();
        assert_eq!(graph.async_steps["first"], 0);
        assert_eq!(graph.async_steps["second"], 1);
        assert_eq!(graph.total_async_steps(), 2);
    }

    #[test]
    fn test_sync_providers_get_no_step_index() {
        let def = pipeline(
            vec![node(
                "p",
                NodeKind::Provider,
                json!({ "providerRef": "resize-v1" }),
            )],
            vec![],
        );
        let graph = compile(&def).unwrap();
        assert!(graph.async_steps.is_empty());
        assert_eq!(graph.total_async_steps(), 0);
    }
}
