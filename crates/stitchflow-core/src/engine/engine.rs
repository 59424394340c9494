//! Pipeline execution engine.
//!
//! `PipelineEngine` topologically walks a compiled graph from its entry
//! node. Fork branches run as independently scheduled tasks on a
//! `tokio::JoinSet`; a join waits for every registered branch to settle
//! (success or failure -- a failing branch is a captured result, never an
//! exception to its siblings) before applying its strategy. Every dispatch
//! checks the run's output cache first, so a node executes at most once per
//! run. Async provider nodes persist a step record and suspend the walk
//! without blocking; resumption comes only through the completion
//! reconciler. Run state is checkpointed through the repository after each
//! settled node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stitchflow_types::error::{ErrorKind, NodeError, RepositoryError};
use stitchflow_types::pipeline::{
    ErrorHandling, JoinStrategy, NodeDefinition, NodeKind, PipelineDefinition, PipelineSettings,
};
use stitchflow_types::run::{NodeRunStatus, RunStatus, StepRecord, StepStatus, TaskRecord};

use crate::graph::compiler::{compile, CompileError, CompiledGraph};
use crate::node::structural::parse_loop_config;
use crate::node::{NodeContext, NodeExecution, NodeRegistry};
use crate::repository::RunRepository;

use super::context::{FlowContext, RunFailure};
use super::expression::ConditionEvaluator;
use super::retry::{backoff_delay, should_retry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default node-level timeout (5 minutes).
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 300;

/// Default run-level timeout (30 minutes).
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 1800;

// ---------------------------------------------------------------------------
// Public result/error types
// ---------------------------------------------------------------------------

/// Result of one engine walk over a run.
///
/// A `Running` status means async steps are still outstanding and the run
/// will converge through the reconciler.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Serialized run context; cached node outputs stay inspectable here
    /// even after the run is terminal.
    pub state: Value,
    /// First terminal error plus the failing node id.
    pub first_failure: Option<RunFailure>,
}

/// Errors surfaced by the engine itself. Node failures flow through run
/// status and `first_failure`, not through this type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error("run timed out")]
    RunTimeout,

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("internal engine error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Shared per-run state
// ---------------------------------------------------------------------------

struct RunControls {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

/// Everything a walk (and its branch tasks) needs, behind one Arc.
struct RunShared<R> {
    graph: Arc<CompiledGraph>,
    ctx: Arc<Mutex<FlowContext>>,
    registry: Arc<NodeRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    repo: Arc<R>,
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
    /// Loop-body children share the run id but must not overwrite the run's
    /// checkpoint row.
    persist: bool,
}

/// A run parked at an async provider node, awaiting its callback.
struct SuspendedRun<R> {
    shared: Arc<RunShared<R>>,
    node_id: String,
}

// ---------------------------------------------------------------------------
// Walk machinery
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WalkEnd {
    /// Reached a terminal node.
    Completed { last: Value },
    /// Parked at an async node. `None` when the suspension happened inside
    /// a fork branch (convergence is counting-only there).
    Suspended { node_id: Option<String> },
    /// Branch mode: stopped at an unresolved join for the fork to aggregate.
    ReachedJoin { join: String, last: Value },
    /// Branch mode: settled failure, captured for join evaluation.
    BranchFailed { node_id: String, error: NodeError },
    /// Main mode: terminal failure under the stop/rollback policy.
    Failed { node_id: String, error: NodeError },
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    Main,
    Branch,
}

/// Where a walk starts: at a node, or just after one that already settled
/// (resumption from a completed async step).
enum WalkStart {
    At(String),
    After(String, Value),
}

enum NodeDispatch {
    Output(Value),
    Suspended,
}

enum Advance {
    Next { node: String, last: Value },
    Done(WalkEnd),
}

enum ForkEnd {
    Continue { join: String, aggregate: Value },
    AllTerminal { first_failure: Option<(String, NodeError)> },
    JoinFailed { join: String, error: NodeError },
    Suspended,
    Cancelled,
    Paused,
}

/// Boxed walk future. Branch tasks and loop bodies re-enter the walk, so the
/// future type must be erased to stay finite.
fn walk_boxed<R>(
    shared: Arc<RunShared<R>>,
    start: WalkStart,
    mode: WalkMode,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<WalkEnd, EngineError>> + Send>>
where
    R: RunRepository + 'static,
{
    Box::pin(walk(shared, start, mode))
}

async fn walk<R>(
    shared: Arc<RunShared<R>>,
    start: WalkStart,
    mode: WalkMode,
) -> Result<WalkEnd, EngineError>
where
    R: RunRepository + 'static,
{
    let mut current;
    let mut last;
    match start {
        WalkStart::At(id) => {
            current = id;
            last = Value::Null;
        }
        WalkStart::After(id, value) => {
            last = value;
            match advance(&shared, &id, &last, mode).await? {
                Advance::Next { node, last: carried } => {
                    current = node;
                    last = carried;
                }
                Advance::Done(end) => return Ok(end),
            }
        }
    }

    loop {
        if shared.cancel.is_cancelled() {
            return Ok(WalkEnd::Cancelled);
        }
        if shared.pause.load(Ordering::SeqCst) {
            return Ok(WalkEnd::Paused);
        }

        // A branch stops at an unresolved join; the owning fork aggregates.
        // A join already resolved by its fork carries its aggregate in the
        // cache and is walked straight through.
        if mode == WalkMode::Branch && shared.graph.is_join(&current) {
            let resolved = shared.ctx.lock().await.output(&current).is_some();
            if !resolved {
                return Ok(WalkEnd::ReachedJoin {
                    join: current,
                    last,
                });
            }
        }

        let node = shared
            .graph
            .node(&current)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("unknown node '{current}'")))?;

        match execute_node(&shared, &node).await {
            Ok(NodeDispatch::Output(value)) => {
                last = value;
            }
            Ok(NodeDispatch::Suspended) => {
                return Ok(WalkEnd::Suspended {
                    node_id: Some(current),
                });
            }
            Err(error) => match mode {
                WalkMode::Branch => {
                    return Ok(WalkEnd::BranchFailed {
                        node_id: current,
                        error,
                    });
                }
                WalkMode::Main => match shared.graph.settings.error_handling {
                    ErrorHandling::Stop => {
                        return Ok(WalkEnd::Failed {
                            node_id: current,
                            error,
                        });
                    }
                    ErrorHandling::Rollback => {
                        record_rollback_manifest(&shared).await;
                        return Ok(WalkEnd::Failed {
                            node_id: current,
                            error,
                        });
                    }
                    ErrorHandling::Continue => {
                        tracing::warn!(
                            node_id = current.as_str(),
                            error = %error,
                            "continuing past failed node"
                        );
                        last = Value::Null;
                    }
                },
            },
        }

        match advance(&shared, &current, &last, mode).await? {
            Advance::Next { node, last: carried } => {
                current = node;
                last = carried;
            }
            Advance::Done(end) => return Ok(end),
        }
    }
}

/// Move past a settled node: select successors and dispatch forks.
async fn advance<R>(
    shared: &Arc<RunShared<R>>,
    node_id: &str,
    last: &Value,
    mode: WalkMode,
) -> Result<Advance, EngineError>
where
    R: RunRepository + 'static,
{
    let node = shared
        .graph
        .node(node_id)
        .cloned()
        .ok_or_else(|| EngineError::Internal(format!("unknown node '{node_id}'")))?;

    let selected = select_successors(shared, &node, last).await;
    match selected.len() {
        0 => Ok(Advance::Done(WalkEnd::Completed { last: last.clone() })),
        1 => {
            let mut selected = selected;
            Ok(Advance::Next {
                node: selected.remove(0),
                last: last.clone(),
            })
        }
        _ => match run_fork(shared, node_id, selected).await? {
            ForkEnd::Continue { join, aggregate } => Ok(Advance::Next {
                node: join,
                last: aggregate,
            }),
            ForkEnd::AllTerminal { first_failure } => match first_failure {
                None => Ok(Advance::Done(WalkEnd::Completed { last: last.clone() })),
                Some((failed_node, error)) => {
                    fail_per_policy(shared, mode, failed_node, error, last).await
                }
            },
            ForkEnd::JoinFailed { join, error } => {
                {
                    let mut ctx = shared.ctx.lock().await;
                    ctx.record_failure(&join, error.clone());
                }
                checkpoint(shared, RunStatus::Running).await;
                match (mode, shared.graph.settings.error_handling) {
                    (WalkMode::Branch, _) => Ok(Advance::Done(WalkEnd::BranchFailed {
                        node_id: join,
                        error,
                    })),
                    (WalkMode::Main, ErrorHandling::Continue) => {
                        // The failed join is memoized; re-entering it hits the
                        // failure memo and the continue policy walks on.
                        Ok(Advance::Next {
                            node: join,
                            last: Value::Null,
                        })
                    }
                    (WalkMode::Main, ErrorHandling::Rollback) => {
                        record_rollback_manifest(shared).await;
                        Ok(Advance::Done(WalkEnd::Failed {
                            node_id: join,
                            error,
                        }))
                    }
                    (WalkMode::Main, ErrorHandling::Stop) => {
                        Ok(Advance::Done(WalkEnd::Failed {
                            node_id: join,
                            error,
                        }))
                    }
                }
            }
            ForkEnd::Suspended => Ok(Advance::Done(WalkEnd::Suspended { node_id: None })),
            ForkEnd::Cancelled => Ok(Advance::Done(WalkEnd::Cancelled)),
            ForkEnd::Paused => Ok(Advance::Done(WalkEnd::Paused)),
        },
    }
}

/// Apply the run's error-handling policy to a failure surfaced by `advance`.
async fn fail_per_policy<R>(
    shared: &Arc<RunShared<R>>,
    mode: WalkMode,
    node_id: String,
    error: NodeError,
    last: &Value,
) -> Result<Advance, EngineError>
where
    R: RunRepository + 'static,
{
    match mode {
        WalkMode::Branch => Ok(Advance::Done(WalkEnd::BranchFailed { node_id, error })),
        WalkMode::Main => match shared.graph.settings.error_handling {
            ErrorHandling::Continue => {
                Ok(Advance::Done(WalkEnd::Completed { last: last.clone() }))
            }
            ErrorHandling::Rollback => {
                record_rollback_manifest(shared).await;
                Ok(Advance::Done(WalkEnd::Failed { node_id, error }))
            }
            ErrorHandling::Stop => Ok(Advance::Done(WalkEnd::Failed { node_id, error })),
        },
    }
}

/// Select the outgoing edges taken from a settled node.
///
/// Condition nodes take the first edge whose guard passes; everything else
/// takes every passing edge (more than one passing edge is a fork). An edge
/// guard that fails to evaluate is treated as not taken.
async fn select_successors<R>(
    shared: &Arc<RunShared<R>>,
    node: &NodeDefinition,
    last: &Value,
) -> Vec<String>
where
    R: RunRepository + 'static,
{
    let edges = shared.graph.successors(&node.id);
    if edges.is_empty() {
        return Vec::new();
    }

    let has_guards = edges.iter().any(|e| e.condition.is_some());
    let expr_ctx = if has_guards {
        let ctx = shared.ctx.lock().await;
        let mut base = ctx.expression_context();
        if let Value::Object(map) = &mut base {
            // Condition nodes expose their boolean directly as `result`.
            let result = last.get("result").cloned().unwrap_or_else(|| last.clone());
            map.insert("result".to_string(), result);
        }
        Some(base)
    } else {
        None
    };

    let mut selected = Vec::new();
    for edge in edges {
        let passes = match (&edge.condition, &expr_ctx) {
            (None, _) => true,
            (Some(expression), Some(context)) => shared
                .evaluator
                .evaluate_bool(expression, context)
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        source = edge.source.as_str(),
                        target = edge.target.as_str(),
                        error = %e,
                        "edge guard failed to evaluate; edge not taken"
                    );
                    false
                }),
            (Some(_), None) => false,
        };
        if passes {
            selected.push(edge.target.clone());
            if node.kind == NodeKind::Condition {
                break;
            }
        }
    }

    // Unselected direct targets of a condition node are visibly skipped.
    if node.kind == NodeKind::Condition {
        let mut ctx = shared.ctx.lock().await;
        for edge in edges {
            if !selected.contains(&edge.target) && ctx.status(&edge.target) == NodeRunStatus::Pending
            {
                ctx.set_status(&edge.target, NodeRunStatus::Skipped);
            }
        }
    }

    selected
}

/// Dispatch fork branches and aggregate at the join they settle on.
async fn run_fork<R>(
    shared: &Arc<RunShared<R>>,
    fork_id: &str,
    branches: Vec<String>,
) -> Result<ForkEnd, EngineError>
where
    R: RunRepository + 'static,
{
    tracing::debug!(fork = fork_id, branches = branches.len(), "dispatching fork branches");

    let mut join_set = JoinSet::new();
    for head in branches {
        let shared = Arc::clone(shared);
        join_set.spawn(async move {
            let end = walk_boxed(Arc::clone(&shared), WalkStart::At(head.clone()), WalkMode::Branch)
                .await;
            (head, end)
        });
    }

    struct Settled {
        head: String,
        order: usize,
        end: WalkEnd,
    }

    let mut settled: Vec<Settled> = Vec::new();
    while let Some(result) = join_set.join_next().await {
        let (head, end) = result
            .map_err(|e| EngineError::Internal(format!("branch task join error: {e}")))?;
        let order = settled.len();
        settled.push(Settled {
            head,
            order,
            end: end?,
        });
    }

    if settled.iter().any(|s| matches!(s.end, WalkEnd::Cancelled)) {
        return Ok(ForkEnd::Cancelled);
    }
    if settled.iter().any(|s| matches!(s.end, WalkEnd::Paused)) {
        return Ok(ForkEnd::Paused);
    }
    if settled
        .iter()
        .any(|s| matches!(s.end, WalkEnd::Suspended { .. }))
    {
        return Ok(ForkEnd::Suspended);
    }

    let mut join_id: Option<String> = None;
    let mut successes: Vec<(usize, String, Value)> = Vec::new();
    let mut failures: Vec<(String, NodeError)> = Vec::new();
    for s in settled {
        match s.end {
            WalkEnd::ReachedJoin { join, last } => {
                match &join_id {
                    None => join_id = Some(join),
                    Some(existing) if *existing == join => {}
                    Some(existing) => {
                        return Err(EngineError::Internal(format!(
                            "fork '{fork_id}' branches settled at different joins \
                             ('{existing}' vs '{join}')"
                        )));
                    }
                }
                successes.push((s.order, s.head, last));
            }
            WalkEnd::BranchFailed { node_id, error } | WalkEnd::Failed { node_id, error } => {
                failures.push((node_id, error));
            }
            WalkEnd::Completed { .. } => {}
            WalkEnd::Suspended { .. } | WalkEnd::Cancelled | WalkEnd::Paused => {}
        }
    }

    let Some(join) = join_id else {
        return Ok(ForkEnd::AllTerminal {
            first_failure: failures.into_iter().next(),
        });
    };

    let strategy = shared.graph.join_strategy(&join);
    match evaluate_join(&join, strategy, &successes, &failures) {
        Ok(aggregate) => {
            {
                let mut ctx = shared.ctx.lock().await;
                ctx.set_output(&join, aggregate.clone());
            }
            checkpoint(shared, RunStatus::Running).await;
            tracing::debug!(join = join.as_str(), strategy = ?strategy, "join resolved");
            Ok(ForkEnd::Continue { join, aggregate })
        }
        Err(error) => Ok(ForkEnd::JoinFailed { join, error }),
    }
}

/// Aggregate settled branch outcomes per the join strategy.
///
/// `successes` carry their completion order; `first` picks the earliest
/// arrival, discarding -- not cancelling -- the rest.
fn evaluate_join(
    join_id: &str,
    strategy: JoinStrategy,
    successes: &[(usize, String, Value)],
    failures: &[(String, NodeError)],
) -> Result<Value, NodeError> {
    let collect = |successes: &[(usize, String, Value)]| {
        let mut map = Map::new();
        for (_, head, value) in successes {
            map.insert(head.clone(), value.clone());
        }
        Value::Object(map)
    };

    match strategy {
        JoinStrategy::All => match failures.first() {
            Some((node_id, error)) => Err(NodeError::execution_failed(format!(
                "join '{join_id}' (all): branch failed at '{node_id}': {error}"
            ))),
            None => Ok(collect(successes)),
        },
        JoinStrategy::Any => {
            if successes.is_empty() {
                let detail = failures
                    .first()
                    .map(|(node_id, error)| format!("'{node_id}': {error}"))
                    .unwrap_or_else(|| "no branches settled".to_string());
                Err(NodeError::execution_failed(format!(
                    "join '{join_id}' (any): no branch succeeded ({detail})"
                )))
            } else {
                Ok(collect(successes))
            }
        }
        JoinStrategy::First => successes
            .iter()
            .min_by_key(|(order, _, _)| *order)
            .map(|(_, _, value)| value.clone())
            .ok_or_else(|| {
                NodeError::execution_failed(format!("join '{join_id}' (first): no branch succeeded"))
            }),
    }
}

/// Execute one node: cache check, pre-resolution, timeout, retry policy,
/// async suspension.
async fn execute_node<R>(
    shared: &Arc<RunShared<R>>,
    node: &NodeDefinition,
) -> Result<NodeDispatch, NodeError>
where
    R: RunRepository + 'static,
{
    // Cache-before-execute: a node runs at most once per run, even when
    // reached via multiple graph paths. Failures are memoized the same way.
    {
        let ctx = shared.ctx.lock().await;
        if let Some(cached) = ctx.output(&node.id) {
            tracing::debug!(node_id = node.id.as_str(), "output cache hit");
            return Ok(NodeDispatch::Output(cached.clone()));
        }
        if let Some(error) = ctx.failure(&node.id) {
            return Err(error.clone());
        }
    }

    let timeout = Duration::from_secs(node.timeout_secs.unwrap_or(DEFAULT_NODE_TIMEOUT_SECS));

    if node.kind == NodeKind::Loop {
        {
            shared
                .ctx
                .lock()
                .await
                .set_status(&node.id, NodeRunStatus::Running);
        }
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, run_loop(shared, node)).await;
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                let mut ctx = shared.ctx.lock().await;
                ctx.record_failure(&node.id, error.clone());
                drop(ctx);
                checkpoint(shared, RunStatus::Running).await;
                return Err(error);
            }
            Err(_elapsed) => {
                let error = NodeError::timeout(format!(
                    "loop '{}' exceeded {}s",
                    node.id,
                    timeout.as_secs()
                ));
                let mut ctx = shared.ctx.lock().await;
                ctx.record_failure(&node.id, error.clone());
                drop(ctx);
                checkpoint(shared, RunStatus::Running).await;
                return Err(error);
            }
        };
        tracing::debug!(
            node_id = node.id.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "loop completed"
        );
        {
            let mut ctx = shared.ctx.lock().await;
            ctx.set_output(&node.id, output.clone());
        }
        checkpoint(shared, RunStatus::Running).await;
        return Ok(NodeDispatch::Output(output));
    }

    let Some(executor) = shared.registry.get(node.kind) else {
        let error = NodeError::internal(format!("no executor for kind '{}'", node.kind.as_str()));
        let mut ctx = shared.ctx.lock().await;
        ctx.record_failure(&node.id, error.clone());
        return Err(error);
    };

    {
        shared
            .ctx
            .lock()
            .await
            .set_status(&node.id, NodeRunStatus::Running);
    }

    let step_index = shared.graph.async_steps.get(&node.id).copied();
    let mut attempt: u32 = 1;

    loop {
        let inputs = {
            let ctx = shared.ctx.lock().await;
            ctx.resolution_context().resolve_all(&node.config)
        };
        let node_ctx = NodeContext {
            node: node.clone(),
            run: Arc::clone(&shared.ctx),
            inputs,
            attempt,
            step_index,
        };

        let outcome = tokio::time::timeout(timeout, executor.execute(node_ctx)).await;
        let error = match outcome {
            Ok(Ok(NodeExecution::Completed(success))) => {
                tracing::debug!(
                    node_id = node.id.as_str(),
                    attempt,
                    duration_ms = success.duration.as_millis() as u64,
                    "node completed"
                );
                {
                    let mut ctx = shared.ctx.lock().await;
                    ctx.set_output(&node.id, success.output.clone());
                }
                checkpoint(shared, RunStatus::Running).await;
                return Ok(NodeDispatch::Output(success.output));
            }
            Ok(Ok(NodeExecution::Suspended(pending))) => {
                let run_id = { shared.ctx.lock().await.run_id };
                let record = StepRecord {
                    run_id,
                    step_index: pending.step_index,
                    node_id: node.id.clone(),
                    kind: node.kind,
                    provider_ref: Some(pending.provider_ref.clone()),
                    provider_task_ref: pending.provider_task_ref.clone(),
                    status: StepStatus::Processing,
                    output: None,
                    error_message: None,
                    completed_at: None,
                };
                if let Err(e) = shared.repo.create_step(&record).await {
                    let error = NodeError::internal(format!("persisting step record: {e}"));
                    let mut ctx = shared.ctx.lock().await;
                    ctx.record_failure(&node.id, error.clone());
                    return Err(error);
                }
                // The node stays Running: "awaiting external event", not a
                // blocked thread.
                {
                    shared
                        .ctx
                        .lock()
                        .await
                        .set_status(&node.id, NodeRunStatus::Running);
                }
                checkpoint(shared, RunStatus::Running).await;
                return Ok(NodeDispatch::Suspended);
            }
            Ok(Err(error)) => error,
            Err(_elapsed) => NodeError::timeout(format!(
                "node '{}' exceeded {}s",
                node.id,
                timeout.as_secs()
            )),
        };

        if let Some(policy) = node.retry.as_ref() {
            if should_retry(Some(policy), error.kind, attempt) {
                let delay = backoff_delay(policy, attempt);
                tracing::warn!(
                    node_id = node.id.as_str(),
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "retrying node"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
        }

        // Exhausted retries surface as RETRY_EXHAUSTED; non-retryable
        // failures keep their original kind.
        let exhausted = node.retry.as_ref().is_some_and(|policy| {
            !error.kind.is_never_retryable()
                && policy.retryable_errors.contains(&error.kind)
                && attempt > policy.max_retries
        });
        let final_error = if exhausted {
            NodeError::new(
                ErrorKind::RetryExhausted,
                format!("node '{}' failed after {} attempts: {}", node.id, attempt, error),
            )
        } else {
            error
        };

        {
            let mut ctx = shared.ctx.lock().await;
            ctx.record_failure(&node.id, final_error.clone());
        }
        checkpoint(shared, RunStatus::Running).await;
        return Err(final_error);
    }
}

/// Execute a loop node: bounded per-iteration sub-graph execution with a
/// fresh output cache per iteration over the shared state map.
async fn run_loop<R>(shared: &Arc<RunShared<R>>, node: &NodeDefinition) -> Result<Value, NodeError>
where
    R: RunRepository + 'static,
{
    let config = parse_loop_config(&node.config)?;

    let (run_id, definition_id, user_id, form) = {
        let ctx = shared.ctx.lock().await;
        (
            ctx.run_id,
            ctx.definition_id,
            ctx.user_id.clone(),
            ctx.form.clone(),
        )
    };

    let body_def = PipelineDefinition {
        id: definition_id,
        name: format!("{}-body", node.id),
        nodes: config.body.nodes.clone(),
        edges: config.body.edges.clone(),
        variables: Default::default(),
        settings: PipelineSettings::default(),
    };
    let body_graph = Arc::new(
        compile(&body_def).map_err(|e| NodeError::invalid_config(format!("loop body: {e}")))?,
    );

    let mut iterations: u32 = 0;
    let mut completed = config.condition.is_none();

    for i in 0..config.max_iterations {
        if shared.cancel.is_cancelled() {
            return Err(NodeError::execution_failed(format!(
                "loop '{}' interrupted by cancellation",
                node.id
            )));
        }

        if let Some(condition) = &config.condition {
            let context = {
                let ctx = shared.ctx.lock().await;
                let mut value = ctx.expression_context();
                if let Value::Object(map) = &mut value {
                    map.insert("iteration".to_string(), json!(i));
                }
                value
            };
            let keep_going = shared
                .evaluator
                .evaluate_bool(condition, &context)
                .map_err(|e| {
                    NodeError::execution_failed(format!("loop '{}' condition: {e}", node.id))
                })?;
            if !keep_going {
                completed = true;
                break;
            }
        }

        let child_ctx = {
            let ctx = shared.ctx.lock().await;
            let mut child = FlowContext::new(run_id, definition_id, user_id.clone(), form.clone());
            child.state = ctx.state.clone();
            child
        };
        let child_shared = Arc::new(RunShared {
            graph: Arc::clone(&body_graph),
            ctx: Arc::new(Mutex::new(child_ctx)),
            registry: Arc::clone(&shared.registry),
            evaluator: Arc::clone(&shared.evaluator),
            repo: Arc::clone(&shared.repo),
            cancel: shared.cancel.clone(),
            pause: Arc::clone(&shared.pause),
            persist: false,
        });

        let end = walk_boxed(
            Arc::clone(&child_shared),
            WalkStart::At(body_graph.entry.clone()),
            WalkMode::Main,
        )
        .await
        .map_err(|e| NodeError::internal(format!("loop '{}' body: {e}", node.id)))?;

        match end {
            WalkEnd::Completed { .. } => {
                let child = child_shared.ctx.lock().await;
                let mut outer = shared.ctx.lock().await;
                for (key, value) in child.state.iter() {
                    outer.state.insert(key.clone(), value.clone());
                }
            }
            WalkEnd::Failed { node_id, error } => {
                return Err(NodeError::execution_failed(format!(
                    "loop '{}' iteration {} failed at '{}': {}",
                    node.id, i, node_id, error
                )));
            }
            WalkEnd::Cancelled | WalkEnd::Paused => {
                return Err(NodeError::execution_failed(format!(
                    "loop '{}' interrupted",
                    node.id
                )));
            }
            other => {
                return Err(NodeError::internal(format!(
                    "loop '{}' body ended unexpectedly: {:?}",
                    node.id, other
                )));
            }
        }

        iterations += 1;
    }

    Ok(json!({ "iterations": iterations, "completed": completed }))
}

/// Record which completed side-effecting nodes would need compensation.
/// External work cannot be recalled; the manifest is the audit trail.
async fn record_rollback_manifest<R>(shared: &Arc<RunShared<R>>)
where
    R: RunRepository + 'static,
{
    let mut ctx = shared.ctx.lock().await;
    let completed: Vec<String> = ctx
        .node_status
        .iter()
        .filter(|(id, status)| {
            **status == NodeRunStatus::Success
                && shared
                    .graph
                    .node(id)
                    .is_some_and(|n| matches!(n.kind, NodeKind::Provider | NodeKind::KbRetrieve))
        })
        .map(|(id, _)| id.clone())
        .collect();
    ctx.set_state("rollback", json!({ "completedNodes": completed }));
}

/// Best-effort run checkpoint: status plus serialized context.
async fn checkpoint<R>(shared: &Arc<RunShared<R>>, status: RunStatus)
where
    R: RunRepository + 'static,
{
    if !shared.persist {
        return;
    }
    let (run_id, state) = {
        let ctx = shared.ctx.lock().await;
        (ctx.run_id, ctx.to_json())
    };
    if let Err(e) = shared
        .repo
        .update_run_status(&run_id, status, None, Some(&state))
        .await
    {
        tracing::error!(run_id = %run_id, error = %e, "checkpoint write failed");
    }
}

// ---------------------------------------------------------------------------
// PipelineEngine
// ---------------------------------------------------------------------------

/// Run-scoped pipeline executor, generic over the persistence port.
pub struct PipelineEngine<R> {
    repo: Arc<R>,
    registry: Arc<NodeRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    controls: DashMap<Uuid, RunControls>,
    suspended: DashMap<Uuid, SuspendedRun<R>>,
}

impl<R: RunRepository + 'static> PipelineEngine<R> {
    pub fn new(repo: Arc<R>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            repo,
            registry,
            evaluator: Arc::new(ConditionEvaluator::new()),
            controls: DashMap::new(),
            suspended: DashMap::new(),
        }
    }

    /// Execute a pipeline definition with a fresh run id.
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
        form: Map<String, Value>,
        user_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_run(Uuid::now_v7(), definition, form, user_id)
            .await
    }

    /// Execute a pipeline definition under a caller-assigned run id.
    pub async fn execute_run(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
        mut form: Map<String, Value>,
        user_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let graph = Arc::new(compile(definition)?);
        for warning in &graph.warnings {
            tracing::warn!(run_id = %run_id, %warning, "compile warning");
        }

        // Executor pre-flight over every node.
        for node in graph.nodes.values() {
            if let Err(error) = self.registry.validate(node) {
                return Err(EngineError::Compile(CompileError::InvalidConfig {
                    node_id: node.id.clone(),
                    message: error.message,
                }));
            }
        }

        // Definition variables seed form defaults.
        for (key, value) in &definition.variables {
            form.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let ctx = FlowContext::new(run_id, definition.id, user_id, form);
        let now = Utc::now();
        let task = TaskRecord {
            id: run_id,
            definition_id: definition.id,
            user_id: user_id.to_string(),
            status: RunStatus::Running,
            state: ctx.to_json(),
            total_async_steps: graph.total_async_steps(),
            dispatch_complete: false,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_run(&task).await?;

        let cancel = CancellationToken::new();
        let pause = Arc::new(AtomicBool::new(false));
        self.controls.insert(
            run_id,
            RunControls {
                cancel: cancel.clone(),
                pause: Arc::clone(&pause),
            },
        );

        let shared = Arc::new(RunShared {
            graph: Arc::clone(&graph),
            ctx: Arc::new(Mutex::new(ctx)),
            registry: Arc::clone(&self.registry),
            evaluator: Arc::clone(&self.evaluator),
            repo: Arc::clone(&self.repo),
            cancel,
            pause,
            persist: true,
        });

        tracing::info!(
            run_id = %run_id,
            pipeline = graph.name.as_str(),
            nodes = graph.nodes.len(),
            async_steps = graph.total_async_steps(),
            "starting pipeline run"
        );

        let run_timeout = Duration::from_secs(
            graph
                .settings
                .timeout_secs
                .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
        );
        let walked = tokio::time::timeout(
            run_timeout,
            walk_boxed(
                Arc::clone(&shared),
                WalkStart::At(graph.entry.clone()),
                WalkMode::Main,
            ),
        )
        .await;

        let end = match walked {
            Ok(end) => end?,
            Err(_elapsed) => {
                self.controls.remove(&run_id);
                let state = { shared.ctx.lock().await.to_json() };
                self.repo
                    .update_run_status(&run_id, RunStatus::Failed, Some("run timed out"), Some(&state))
                    .await?;
                return Err(EngineError::RunTimeout);
            }
        };

        self.finalize(shared, end).await
    }

    /// Settle a finished walk into a persisted run status.
    async fn finalize(
        &self,
        shared: Arc<RunShared<R>>,
        end: WalkEnd,
    ) -> Result<ExecutionResult, EngineError> {
        let run_id = { shared.ctx.lock().await.run_id };

        let status = match end {
            WalkEnd::Completed { .. } => {
                self.repo.mark_dispatch_complete(&run_id).await?;
                if self.open_steps(&run_id).await? == 0 {
                    RunStatus::Succeeded
                } else {
                    // Async steps still outstanding; the reconciler converges.
                    RunStatus::Running
                }
            }
            WalkEnd::Suspended { node_id } => {
                self.repo.mark_dispatch_complete(&run_id).await?;
                if let Some(node_id) = node_id {
                    self.suspended.insert(
                        run_id,
                        SuspendedRun {
                            shared: Arc::clone(&shared),
                            node_id,
                        },
                    );
                }
                RunStatus::Running
            }
            WalkEnd::Failed { node_id, error } | WalkEnd::BranchFailed { node_id, error } => {
                let mut ctx = shared.ctx.lock().await;
                ctx.record_failure(&node_id, error);
                RunStatus::Failed
            }
            WalkEnd::Cancelled => RunStatus::Cancelled,
            WalkEnd::Paused => RunStatus::Paused,
            WalkEnd::ReachedJoin { join, .. } => {
                return Err(EngineError::Internal(format!(
                    "main walk stopped at join '{join}'"
                )));
            }
        };

        let (state, first_failure) = {
            let ctx = shared.ctx.lock().await;
            (ctx.to_json(), ctx.first_failure.clone())
        };
        let error_message = first_failure
            .as_ref()
            .map(|f| format!("node '{}': {}", f.node_id, f.error));
        self.repo
            .update_run_status(&run_id, status, error_message.as_deref(), Some(&state))
            .await?;

        if status.is_terminal() {
            self.controls.remove(&run_id);
            self.suspended.remove(&run_id);
        }

        tracing::info!(run_id = %run_id, status = status.as_str(), "pipeline run settled");

        Ok(ExecutionResult {
            run_id,
            status,
            state,
            first_failure,
        })
    }

    async fn open_steps(&self, run_id: &Uuid) -> Result<u64, EngineError> {
        let pending = self
            .repo
            .count_steps_by_status(run_id, StepStatus::Pending)
            .await?;
        let processing = self
            .repo
            .count_steps_by_status(run_id, StepStatus::Processing)
            .await?;
        Ok(pending + processing)
    }

    /// Cancel a run: no further state transitions are accepted, and later
    /// callbacks become accepted-but-inert. In-flight external work is not
    /// recalled.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some((_, controls)) = self.controls.remove(&run_id) else {
            return Err(EngineError::RunNotFound(run_id));
        };
        controls.cancel.cancel();
        self.suspended.remove(&run_id);
        self.repo
            .update_run_status(&run_id, RunStatus::Cancelled, Some("cancelled by user"), None)
            .await?;
        tracing::info!(run_id = %run_id, "run cancelled");
        Ok(())
    }

    /// Pause a run: stops new dispatch; already-dispatched async steps still
    /// get reconciled.
    pub async fn pause(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some(controls) = self.controls.get(&run_id) else {
            return Err(EngineError::RunNotFound(run_id));
        };
        controls.pause.store(true, Ordering::SeqCst);
        drop(controls);
        self.repo
            .update_run_status(&run_id, RunStatus::Paused, None, None)
            .await?;
        tracing::info!(run_id = %run_id, "run paused");
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R: RunRepository + 'static> crate::reconcile::RunResumer for PipelineEngine<R> {
    /// Resume a run parked at `node_id` with the callback's output.
    ///
    /// Returns `false` when this engine is not holding the suspension (other
    /// process, fork-internal suspension, already resumed); the reconciler
    /// then converges by step counting instead.
    async fn resume_step(&self, run_id: Uuid, node_id: &str, output: Value) -> bool {
        let Some((_, suspended)) = self.suspended.remove(&run_id) else {
            return false;
        };
        if suspended.node_id != node_id {
            self.suspended.insert(run_id, suspended);
            return false;
        }

        let shared = suspended.shared;
        {
            let mut ctx = shared.ctx.lock().await;
            ctx.set_output(node_id, output.clone());
        }
        tracing::info!(run_id = %run_id, node_id, "resuming run from completed async step");

        let end = match walk_boxed(
            Arc::clone(&shared),
            WalkStart::After(node_id.to_string(), output),
            WalkMode::Main,
        )
        .await
        {
            Ok(end) => end,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "resume walk failed");
                let _ = self
                    .repo
                    .update_run_status(
                        &run_id,
                        RunStatus::Failed,
                        Some(&format!("resume failed: {e}")),
                        None,
                    )
                    .await;
                return true;
            }
        };

        if let Err(e) = self.finalize(shared, end).await {
            tracing::error!(run_id = %run_id, error = %e, "finalizing resumed run failed");
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
