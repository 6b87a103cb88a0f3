/// Graph execution engine
///
/// Walks a workflow graph from its start nodes, applying the control-flow
/// semantics of each node kind:
/// - if/switch route along one tagged edge
/// - merge waits for every predecessor and fires exactly once
/// - loops run their body node synchronously per iteration
/// - failures follow `error` edges or end their own branch
///
/// Each node visit is recorded as an `ExecutionStep`. Breakpoints, step mode
/// and human-input nodes suspend on the `PauseHub` until resumed, cancelled or
/// timed out. Branch fan-out is structured: every spawned branch is awaited
/// before the visit that spawned it returns.

use crate::runtime::error::EngineError;
use crate::runtime::executor::{eval_condition, resolve_path, truthy, NodeRegistry, NodeResult};
use crate::runtime::pause::{PauseHub, PauseSignal, WaitKind};
use crate::store::{Execution, ExecutionStatus, ExecutionStep, ExecutionStore, StepStatus};
use crate::workflow::types::{ControlKind, Edge, Node, NodeContext, WorkflowDefinition};
use anyhow::Result;
use chrono::Utc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinSet;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const ERROR_HANDLE: &str = "error";

/// Final result of one `run`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Node outputs keyed by node id
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Everything needed to start a replay of an earlier execution
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub workflow_id: String,
    pub input: Value,
    pub options: RunOptions,
}

/// Optional knobs for `Engine::run_with`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use this id instead of generating one
    pub execution_id: Option<String>,
    /// Initial execution metadata; `debug.stepMode = true` starts in step mode
    pub metadata: Option<Value>,
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// petgraph view of a definition
///
/// Edge weights are positions in `definition.edges` so declaration order can
/// be restored after petgraph's adjacency iteration.
#[derive(Debug)]
struct WorkflowGraph {
    graph: DiGraph<String, usize>,
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    fn build(definition: &WorkflowDefinition) -> Self {
        tracing::debug!(
            "📊 Building graph for '{}' with {} nodes and {} edges",
            definition.id,
            definition.nodes.len(),
            definition.edges.len()
        );

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &definition.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for (position, edge) in definition.edges.iter().enumerate() {
            match (node_id_to_index.get(&edge.source), node_id_to_index.get(&edge.target)) {
                (Some(&from), Some(&to)) => {
                    graph.add_edge(from, to, position);
                }
                _ => tracing::warn!(
                    "⚠️ Skipping edge '{}' → '{}': references an unknown node",
                    edge.source,
                    edge.target
                ),
            }
        }

        Self { graph, node_id_to_index }
    }

    fn edge_positions(&self, node_id: &str, direction: Direction) -> Vec<usize> {
        let Some(&index) = self.node_id_to_index.get(node_id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| *edge.weight())
            .collect();
        positions.sort_unstable();
        positions
    }

    fn outgoing<'d>(&self, definition: &'d WorkflowDefinition, node_id: &str) -> Vec<&'d Edge> {
        self.edge_positions(node_id, Direction::Outgoing)
            .into_iter()
            .filter_map(|position| definition.edges.get(position))
            .collect()
    }

    /// Distinct source node ids of incoming edges, in edge order
    fn predecessors(&self, definition: &WorkflowDefinition, node_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.edge_positions(node_id, Direction::Incoming)
            .into_iter()
            .filter_map(|position| definition.edges.get(position))
            .filter(|edge| seen.insert(edge.source.clone()))
            .map(|edge| edge.source.clone())
            .collect()
    }

    fn has_incoming(&self, node_id: &str) -> bool {
        !self.edge_positions(node_id, Direction::Incoming).is_empty()
    }

    fn start_nodes(&self, definition: &WorkflowDefinition) -> Vec<String> {
        let starts: Vec<String> = definition
            .nodes
            .iter()
            .filter(|node| !self.has_incoming(&node.id) || node.kind() == ControlKind::Trigger)
            .map(|node| node.id.clone())
            .collect();
        if !starts.is_empty() {
            return starts;
        }

        let Some(first) = definition.nodes.first() else {
            return Vec::new();
        };

        let roots: Vec<String> = definition
            .nodes
            .iter()
            .filter(|node| !self.has_incoming(&node.id))
            .map(|node| node.id.clone())
            .collect();
        if !roots.is_empty() {
            return roots;
        }

        tracing::warn!(
            "⚠️ Workflow '{}' has no start node (cyclic: {}), falling back to '{}'",
            definition.id,
            petgraph::algo::is_cyclic_directed(&self.graph),
            first.id
        );
        vec![first.id.clone()]
    }
}

/// Shared state of one in-flight execution
struct RunState {
    execution_id: String,
    definition: Arc<WorkflowDefinition>,
    graph: WorkflowGraph,
    input: Value,
    execution: tokio::sync::Mutex<Execution>,
    /// Latest result per node id
    results: Mutex<HashMap<String, NodeResult>>,
    /// Serializes step-number allocation and merge claims
    serial: tokio::sync::Mutex<()>,
    fired_merges: Mutex<HashSet<String>>,
    cancelled: AtomicBool,
    /// Wakes branches sleeping between retry attempts
    cancel_signal: Notify,
    step_mode: AtomicBool,
}

/// Cheap handle that walks the graph of one execution
#[derive(Clone)]
struct Walker {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<dyn NodeRegistry>,
    pause: Arc<PauseHub>,
    run: Arc<RunState>,
}

impl Walker {
    fn ensure_live(&self) -> Result<()> {
        if self.run.cancelled.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled {
                execution_id: self.run.execution_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn definition(&self) -> &WorkflowDefinition {
        &self.run.definition
    }

    /// Visit a node and then its successors
    fn visit(&self, node_id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_live()?;

            let Some(node) = self.definition().node(&node_id).cloned() else {
                tracing::warn!("⚠️ Node '{}' not found, skipping", node_id);
                return Ok(());
            };

            let Some(result) = self.execute_step(&node, None, None).await? else {
                return Ok(());
            };

            self.dispatch_successors(&node, &result).await
        })
    }

    /// Record and execute one node visit without dispatching successors
    ///
    /// Returns `None` when a merge node is not ready yet or has already fired.
    fn execute_step<'a>(
        &'a self,
        node: &'a Node,
        extra_input: Option<Map<String, Value>>,
        parent_step_id: Option<String>,
    ) -> BoxFuture<'a, Result<Option<NodeResult>>> {
        Box::pin(async move {
            let kind = node.kind();

            let (mut step, mut input) = {
                let _serial = self.run.serial.lock().await;

                if kind == ControlKind::Merge && !self.claim_merge(&node.id) {
                    return Ok(None);
                }

                let mut input = self.gather_input(&node.id);
                if let Some(extra) = extra_input {
                    input.extend(extra);
                }

                let step_number = self.store.next_step_number(&self.run.execution_id).await?;
                let step = ExecutionStep {
                    id: uuid::Uuid::new_v4().to_string(),
                    execution_id: self.run.execution_id.clone(),
                    step_number,
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    status: StepStatus::Running,
                    input: Value::Object(input.clone()),
                    output: None,
                    error: None,
                    retry_attempt: 0,
                    execution_time_ms: None,
                    parent_step_id,
                    started_at: Utc::now(),
                    finished_at: None,
                };
                self.store
                    .create_step(&step)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to record step for node '{}': {}", node.id, e))?;
                (step, input)
            };

            tracing::debug!("📍 Step {}: node '{}' ({})", step.step_number, node.id, node.node_type);

            if node.breakpoint || self.run.step_mode.load(Ordering::SeqCst) {
                match self.suspend(&node.id, step.step_number, &input, WaitKind::Breakpoint).await {
                    Ok(PauseSignal::Resume { modifications }) => merge_into(&mut input, modifications),
                    Ok(PauseSignal::Input(payload)) => merge_into(&mut input, Some(payload)),
                    Ok(PauseSignal::Cancel) => return self.abort_step(step, self.cancelled_error()).await,
                    Err(e) => return self.abort_step(step, e).await,
                }
            }

            if kind == ControlKind::HumanInput {
                match self.suspend(&node.id, step.step_number, &input, WaitKind::HumanInput).await {
                    Ok(PauseSignal::Input(payload)) => merge_into(&mut input, Some(payload)),
                    Ok(PauseSignal::Resume { modifications }) => merge_into(&mut input, modifications),
                    Ok(PauseSignal::Cancel) => return self.abort_step(step, self.cancelled_error()).await,
                    Err(e) => return self.abort_step(step, e).await,
                }
            }

            step.input = Value::Object(input.clone());
            let context = NodeContext {
                node_id: node.id.clone(),
                workflow_id: self.definition().id.clone(),
                execution_id: self.run.execution_id.clone(),
                input: Value::Object(input),
                config: node.config.clone(),
            };

            let started = Instant::now();
            let (mut result, retries) = match self.execute_with_retry(node, &context).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = EngineError::classify(&e)
                        .cloned()
                        .unwrap_or_else(|| EngineError::Store(e.to_string()));
                    return self.abort_step(step, error).await;
                }
            };

            if result.success && kind.is_loop() {
                // Body iterations see the loop node's own pass-through output
                self.record_result(&node.id, result.clone());
                result = self.run_loop(node, kind, &context.input, &step.id).await?;
            }

            if !result.success {
                result.output = json!({
                    "error": result.error.clone().unwrap_or_default(),
                    "originalInput": context.input,
                    "failedNodeId": node.id,
                });
            }

            step.status = if result.success { StepStatus::Completed } else { StepStatus::Failed };
            step.output = Some(result.output.clone());
            step.error = result.error.clone();
            step.retry_attempt = retries;
            step.execution_time_ms = Some(started.elapsed().as_millis() as u64);
            step.finished_at = Some(Utc::now());
            self.store
                .update_step(&step)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to finalize step for node '{}': {}", node.id, e))?;

            self.record_result(&node.id, result.clone());

            if result.success {
                let node_id = node.id.clone();
                let output = result.output.clone();
                self.update_execution(move |execution| {
                    let variables = metadata_entry(execution, "variables");
                    if !variables.is_object() {
                        *variables = json!({});
                    }
                    variables[node_id.as_str()] = output;
                })
                .await?;
                tracing::info!("✅ Node '{}' completed in {:?}", node.id, started.elapsed());
            } else {
                tracing::warn!(
                    "❌ Node '{}' failed after {} attempt(s): {}",
                    node.id,
                    retries + 1,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }

            Ok(Some(result))
        })
    }

    /// Call the registry, retrying failed attempts per the node's retry policy
    ///
    /// Each attempt runs on its own task so a panicking node body becomes a
    /// failed result instead of tearing down the branch.
    async fn execute_with_retry(&self, node: &Node, context: &NodeContext) -> Result<(NodeResult, u32)> {
        let retry = node.retry_config(&self.definition().settings);
        let attempts = retry.as_ref().map(|r| r.attempts()).unwrap_or(1);
        let mut attempt = 1;

        loop {
            let registry = Arc::clone(&self.registry);
            let node_type = node.node_type.clone();
            let attempt_context = context.clone();

            let result = match tokio::spawn(async move { registry.execute(&node_type, &attempt_context).await }).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => NodeResult::failure(format!("Node '{}' raised an unexpected error: {}", node.id, e)),
                Err(e) => NodeResult::failure(format!("Node '{}' panicked: {}", node.id, e)),
            };

            if result.success || attempt >= attempts {
                return Ok((result, attempt - 1));
            }

            let delay = retry.as_ref().map(|r| r.delay_after(attempt)).unwrap_or_default();
            tracing::warn!(
                "🔁 Node '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                node.id,
                attempt,
                attempts,
                delay,
                result.error.as_deref().unwrap_or("unknown error")
            );
            let cancelled = self.run.cancel_signal.notified();
            self.ensure_live()?;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled => {}
            }
            self.ensure_live()?;
            attempt += 1;
        }
    }

    /// Iterate the loop body and build the loop node's `{ results, count }` output
    async fn run_loop(&self, node: &Node, kind: ControlKind, loop_input: &Value, step_id: &str) -> Result<NodeResult> {
        let body = self
            .loop_body(&node.id)
            .and_then(|body_id| self.definition().node(&body_id).cloned());
        let Some(body) = body else {
            tracing::warn!("⚠️ Loop node '{}' has no body node", node.id);
            return Ok(loop_output(Vec::new()));
        };

        let mut results = Vec::new();

        match kind {
            ControlKind::LoopFor => {
                let start = config_u64(node, "startIndex").unwrap_or(0);
                let count = config_u64(node, "count").unwrap_or(0);
                for index in start..start.saturating_add(count) {
                    let result = self.iterate(&body, json!(index), index, step_id).await?;
                    if !result.success {
                        return Ok(iteration_failure(&node.id, &body.id, index, &result));
                    }
                    results.push(result.output);
                }
            }
            ControlKind::LoopForEach => {
                for (index, item) in foreach_items(node, loop_input).into_iter().enumerate() {
                    let index = index as u64;
                    let result = self.iterate(&body, item, index, step_id).await?;
                    if !result.success {
                        return Ok(iteration_failure(&node.id, &body.id, index, &result));
                    }
                    results.push(result.output);
                }
            }
            ControlKind::LoopWhile => {
                let limit = self.definition().settings.max_loop_iterations;
                let condition = node.config_str("condition").unwrap_or("false").to_string();
                let mut last = Value::Null;
                let mut index: usize = 0;

                loop {
                    let index_value = json!(index);
                    let keep_going = match eval_condition(
                        &condition,
                        &[("index", &index_value), ("input", loop_input), ("last", &last)],
                    ) {
                        Ok(keep_going) => keep_going,
                        Err(e) => return Ok(NodeResult::failure(format!("Loop condition failed: {}", e))),
                    };
                    if !keep_going {
                        break;
                    }
                    if index >= limit {
                        let guard = EngineError::LoopGuardExceeded {
                            node_id: node.id.clone(),
                            limit,
                        };
                        return Ok(NodeResult::failure(guard.to_string()));
                    }

                    let result = self.iterate(&body, last.clone(), index as u64, step_id).await?;
                    if !result.success {
                        return Ok(iteration_failure(&node.id, &body.id, index as u64, &result));
                    }
                    last = result.output.clone();
                    results.push(result.output);
                    index += 1;
                }
            }
            _ => {}
        }

        tracing::debug!("🔄 Loop '{}' finished after {} iteration(s)", node.id, results.len());
        Ok(loop_output(results))
    }

    async fn iterate(&self, body: &Node, item: Value, index: u64, parent_step_id: &str) -> Result<NodeResult> {
        self.ensure_live()?;

        let mut extra = Map::new();
        extra.insert("item".to_string(), item);
        extra.insert("index".to_string(), json!(index));

        Ok(self
            .execute_step(body, Some(extra), Some(parent_step_id.to_string()))
            .await?
            .unwrap_or_else(|| NodeResult::success(Value::Null)))
    }

    /// Body edge: tagged `body`/`loop`, else the first outgoing edge
    fn loop_body(&self, node_id: &str) -> Option<String> {
        let edges = self.run.graph.outgoing(self.definition(), node_id);
        edges
            .iter()
            .find(|edge| matches!(edge.source_handle.as_deref(), Some("body") | Some("loop")))
            .or_else(|| edges.first())
            .map(|edge| edge.target.clone())
    }

    async fn dispatch_successors(&self, node: &Node, result: &NodeResult) -> Result<()> {
        let edges: Vec<&Edge> = self.run.graph.outgoing(self.definition(), &node.id);
        let is_error_edge = |edge: &&Edge| edge.source_handle.as_deref() == Some(ERROR_HANDLE);
        let normal: Vec<&Edge> = edges.iter().copied().filter(|e| !is_error_edge(e)).collect();

        let selected: Vec<&Edge> = if result.success {
            match node.kind() {
                ControlKind::If => {
                    let handle = if result.output.get("condition").map(truthy).unwrap_or(false) {
                        "true"
                    } else {
                        "false"
                    };
                    normal
                        .iter()
                        .copied()
                        .find(|edge| edge.source_handle.as_deref() == Some(handle))
                        .into_iter()
                        .collect()
                }
                ControlKind::Switch => {
                    let case = case_label(result.output.get("case"));
                    normal
                        .iter()
                        .copied()
                        .find(|edge| edge.source_handle.as_deref() == Some(case.as_str()))
                        .or_else(|| {
                            normal
                                .iter()
                                .copied()
                                .find(|edge| edge.source_handle.as_deref() == Some("default"))
                        })
                        .into_iter()
                        .collect()
                }
                kind if kind.is_loop() => {
                    let body = self.loop_body(&node.id);
                    normal
                        .into_iter()
                        .filter(|edge| Some(&edge.target) != body.as_ref())
                        .collect()
                }
                _ => normal,
            }
        } else {
            let error_edges: Vec<&Edge> = edges.iter().copied().filter(is_error_edge).collect();
            if !error_edges.is_empty() {
                tracing::info!("↪️ Routing failure of '{}' along {} error edge(s)", node.id, error_edges.len());
                error_edges
            } else if self.definition().settings.error_handling.continue_on_error {
                tracing::info!("⏭️ Continuing past failed node '{}'", node.id);
                normal
            } else {
                tracing::debug!("🛑 Branch ends at failed node '{}'", node.id);
                return Ok(());
            }
        };

        let targets = selected.into_iter().map(|edge| edge.target.clone()).collect();
        self.dispatch(targets).await
    }

    /// Fan out to `targets` in parallel; merge targets go last, one at a time
    async fn dispatch(&self, targets: Vec<String>) -> Result<()> {
        let mut seen = HashSet::new();
        let (merges, parallel): (Vec<String>, Vec<String>) = targets
            .into_iter()
            .filter(|target| seen.insert(target.clone()))
            .partition(|target| {
                self.definition()
                    .node(target)
                    .map(|node| node.kind() == ControlKind::Merge)
                    .unwrap_or(false)
            });

        let mut branches = JoinSet::new();
        for target in parallel {
            let walker = self.clone();
            branches.spawn(async move { walker.visit(target).await });
        }

        let mut errors = Vec::new();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(anyhow::anyhow!("Branch task failed: {}", e)),
            }
        }

        for merge in merges {
            if let Err(e) = self.visit(merge).await {
                errors.push(e);
            }
        }

        settle(errors)
    }

    /// True when every predecessor has a result and the merge has not fired
    ///
    /// Called with the serial lock held.
    fn claim_merge(&self, node_id: &str) -> bool {
        let predecessors = self.run.graph.predecessors(self.definition(), node_id);
        let ready = {
            let results = lock(&self.run.results);
            predecessors.iter().all(|p| results.contains_key(p))
        };
        if !ready {
            tracing::debug!("⏳ Merge '{}' waiting for remaining predecessors", node_id);
            return false;
        }
        lock(&self.run.fired_merges).insert(node_id.to_string())
    }

    /// Original input merged with every direct predecessor's output
    ///
    /// Object outputs merge key-wise, later predecessors winning; other
    /// outputs land under the predecessor's node id.
    fn gather_input(&self, node_id: &str) -> Map<String, Value> {
        let mut merged = match &self.run.input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };

        let predecessors = self.run.graph.predecessors(self.definition(), node_id);
        let results = lock(&self.run.results);
        for predecessor in predecessors {
            match results.get(&predecessor).map(|r| &r.output) {
                Some(Value::Object(output)) => {
                    merged.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    merged.insert(predecessor, other.clone());
                }
            }
        }
        merged
    }

    fn record_result(&self, node_id: &str, result: NodeResult) {
        lock(&self.run.results).insert(node_id.to_string(), result);
    }

    /// Mark the execution paused, wait on the hub, then mark it running again
    async fn suspend(
        &self,
        node_id: &str,
        step_number: i64,
        input: &Map<String, Value>,
        kind: WaitKind,
    ) -> Result<PauseSignal, EngineError> {
        let wait = self.pause.register(&self.run.execution_id, node_id, kind);

        let debug = json!({
            "pausedAt": node_id,
            "waitKind": match kind {
                WaitKind::Breakpoint => "breakpoint",
                WaitKind::HumanInput => "human_input",
            },
            "stepMode": self.run.step_mode.load(Ordering::SeqCst),
            "snapshot": {
                "nodeId": node_id,
                "stepNumber": step_number,
                "input": input,
            },
        });
        self.update_execution(move |execution| {
            execution.status = ExecutionStatus::Paused;
            *metadata_entry(execution, "debug") = debug;
        })
        .await
        .map_err(|e| EngineError::Store(e.to_string()))?;

        tracing::info!("⏸️ Execution {} paused at node '{}'", self.run.execution_id, node_id);

        let signal = self.pause.wait(wait).await?;

        if signal != PauseSignal::Cancel && self.pause.waiting_nodes(&self.run.execution_id).is_empty() {
            let step_mode = self.run.step_mode.load(Ordering::SeqCst);
            self.update_execution(move |execution| {
                execution.status = ExecutionStatus::Running;
                let debug = metadata_entry(execution, "debug");
                if debug.is_object() {
                    debug["pausedAt"] = Value::Null;
                    debug["stepMode"] = Value::Bool(step_mode);
                }
            })
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
            tracing::info!("▶️ Execution {} resumed at node '{}'", self.run.execution_id, node_id);
        }

        Ok(signal)
    }

    fn cancelled_error(&self) -> EngineError {
        EngineError::Cancelled {
            execution_id: self.run.execution_id.clone(),
        }
    }

    /// Finalize a step interrupted before its body ran and unwind the branch
    async fn abort_step(&self, mut step: ExecutionStep, error: EngineError) -> Result<Option<NodeResult>> {
        if matches!(error, EngineError::Cancelled { .. }) {
            self.run.cancelled.store(true, Ordering::SeqCst);
        }

        step.status = StepStatus::Failed;
        step.error = Some(error.to_string());
        step.finished_at = Some(Utc::now());
        if let Err(e) = self.store.update_step(&step).await {
            tracing::error!("❌ Failed to finalize interrupted step {}: {}", step.id, e);
        }

        Err(error.into())
    }

    async fn update_execution(&self, apply: impl FnOnce(&mut Execution) + Send) -> Result<()> {
        let mut execution = self.run.execution.lock().await;
        apply(&mut execution);
        self.store.update_execution(&execution).await
    }
}

/// Shallow-merge an object into the node input; non-objects are ignored
fn merge_into(input: &mut Map<String, Value>, patch: Option<Value>) {
    if let Some(Value::Object(patch)) = patch {
        input.extend(patch);
    }
}

fn metadata_entry<'a>(execution: &'a mut Execution, key: &str) -> &'a mut Value {
    if !execution.metadata.is_object() {
        execution.metadata = Value::Object(Map::new());
    }
    &mut execution.metadata[key]
}

fn case_label(case: Option<&Value>) -> String {
    match case {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn config_u64(node: &Node, key: &str) -> Option<u64> {
    match node.config.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `config.items`: array literal, or JSONPath into the loop input
fn foreach_items(node: &Node, loop_input: &Value) -> Vec<Value> {
    match node.config.get("items") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(path)) => match resolve_path(loop_input, path) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        },
        _ => loop_input
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

fn loop_output(results: Vec<Value>) -> NodeResult {
    let count = results.len();
    NodeResult::success(json!({ "results": results, "count": count }))
}

fn iteration_failure(loop_id: &str, body_id: &str, index: u64, result: &NodeResult) -> NodeResult {
    NodeResult::failure(format!(
        "Loop '{}' body '{}' failed at iteration {}: {}",
        loop_id,
        body_id,
        index,
        result.error.as_deref().unwrap_or("unknown error")
    ))
}

/// Collapse branch errors, preferring a cancellation
fn settle(mut errors: Vec<anyhow::Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let position = errors
        .iter()
        .position(EngineError::is_cancellation)
        .unwrap_or(0);
    Err(errors.swap_remove(position))
}

/// Orchestrates executions and exposes the debug controls
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<dyn NodeRegistry>,
    pause: Arc<PauseHub>,
    /// Key: execution_id
    runs: Mutex<HashMap<String, Arc<RunState>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ExecutionStore>, registry: Arc<dyn NodeRegistry>, pause: Arc<PauseHub>) -> Self {
        Self {
            store,
            registry,
            pause,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        Arc::clone(&self.store)
    }

    pub fn pause_hub(&self) -> Arc<PauseHub> {
        Arc::clone(&self.pause)
    }

    pub async fn run(&self, definition: Arc<WorkflowDefinition>, input: Value) -> Result<ExecutionResult> {
        self.run_with(definition, input, RunOptions::default()).await
    }

    /// Execute a definition to completion
    ///
    /// Node failures never surface as `Err`; they end in the returned status.
    /// `Err` means the execution record itself could not be created.
    pub async fn run_with(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        options: RunOptions,
    ) -> Result<ExecutionResult> {
        let execution_id = options
            .execution_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut metadata = match options.metadata {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let step_mode = metadata
            .get("debug")
            .and_then(|debug| debug.get("stepMode"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        metadata.entry("variables").or_insert_with(|| json!({}));

        let mut execution = Execution::new(
            execution_id.clone(),
            definition.id.clone(),
            input.clone(),
            Value::Object(metadata),
        );
        self.store
            .create_execution(&execution)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create execution {}: {}", execution_id, e))?;

        execution.status = ExecutionStatus::Running;
        self.store.update_execution(&execution).await?;

        let graph = WorkflowGraph::build(&definition);
        let starts = graph.start_nodes(&definition);

        let run = Arc::new(RunState {
            execution_id: execution_id.clone(),
            definition: Arc::clone(&definition),
            graph,
            input,
            execution: tokio::sync::Mutex::new(execution),
            results: Mutex::new(HashMap::new()),
            serial: tokio::sync::Mutex::new(()),
            fired_merges: Mutex::new(HashSet::new()),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            step_mode: AtomicBool::new(step_mode),
        });
        lock(&self.runs).insert(execution_id.clone(), Arc::clone(&run));

        tracing::info!(
            "🚀 Starting execution {} of workflow '{}' from {:?}",
            execution_id,
            definition.id,
            starts
        );
        let started = Instant::now();

        let walker = Walker {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            pause: Arc::clone(&self.pause),
            run: Arc::clone(&run),
        };
        let outcome = walker.dispatch(starts).await;

        lock(&self.runs).remove(&execution_id);

        let output: Map<String, Value> = lock(&run.results)
            .iter()
            .map(|(node_id, result)| (node_id.clone(), result.output.clone()))
            .collect();

        let (status, error) = match outcome {
            _ if run.cancelled.load(Ordering::SeqCst) => (
                ExecutionStatus::Cancelled,
                Some(EngineError::Cancelled { execution_id: execution_id.clone() }.to_string()),
            ),
            Ok(()) => (ExecutionStatus::Completed, None),
            Err(e) if EngineError::is_cancellation(&e) => (ExecutionStatus::Cancelled, Some(e.to_string())),
            Err(e) => (ExecutionStatus::Failed, Some(e.to_string())),
        };

        {
            let mut execution = run.execution.lock().await;
            execution.status = status;
            execution.output = Some(Value::Object(output.clone()));
            execution.error = error.clone();
            execution.finished_at = Some(Utc::now());
            self.store.update_execution(&execution).await?;
        }

        match status {
            ExecutionStatus::Completed => tracing::info!(
                "🎉 Execution {} of '{}' completed in {:?}",
                execution_id,
                definition.id,
                started.elapsed()
            ),
            _ => tracing::warn!(
                "⚠️ Execution {} of '{}' ended {}: {}",
                execution_id,
                definition.id,
                status,
                error.as_deref().unwrap_or("")
            ),
        }

        Ok(ExecutionResult {
            execution_id,
            status,
            output: Some(Value::Object(output)),
            error,
        })
    }

    fn live_run(&self, execution_id: &str) -> Result<Arc<RunState>> {
        lock(&self.runs)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()).into())
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        lock(&self.runs).contains_key(execution_id)
    }

    /// Release every breakpoint waiter and leave step mode
    ///
    /// `modifications` (an object) is merged into the paused node's input.
    /// Returns the number of released waiters.
    pub fn resume(&self, execution_id: &str, modifications: Option<Value>) -> Result<usize> {
        let run = self.live_run(execution_id)?;
        run.step_mode.store(false, Ordering::SeqCst);
        let released = self.pause.resume(execution_id, modifications);
        tracing::info!("▶️ Resume requested for {} ({} waiter(s))", execution_id, released);
        Ok(released)
    }

    /// Release the oldest breakpoint waiter and stay in step mode
    pub fn step(&self, execution_id: &str) -> Result<bool> {
        let run = self.live_run(execution_id)?;
        run.step_mode.store(true, Ordering::SeqCst);
        let released = self.pause.step(execution_id);
        tracing::info!("⏭️ Step requested for {} (released: {})", execution_id, released);
        Ok(released)
    }

    /// Cancel an execution
    ///
    /// A live run unwinds at its next wait or node boundary; a stale
    /// non-terminal record is marked cancelled directly.
    pub async fn cancel(&self, execution_id: &str) -> Result<usize> {
        if let Ok(run) = self.live_run(execution_id) {
            run.cancelled.store(true, Ordering::SeqCst);
            run.cancel_signal.notify_waiters();
            let released = self.pause.cancel(execution_id);
            tracing::info!("🛑 Cancel requested for {} ({} waiter(s))", execution_id, released);
            return Ok(released);
        }

        let error = EngineError::Cancelled { execution_id: execution_id.to_string() }.to_string();
        self.close_orphaned(execution_id, ExecutionStatus::Cancelled, error).await?;
        Ok(0)
    }

    /// Give a non-terminal record that no live run owns its terminal status
    ///
    /// Returns whether the record changed. Live runs are left alone.
    pub async fn close_orphaned(&self, execution_id: &str, status: ExecutionStatus, error: String) -> Result<bool> {
        if self.is_running(execution_id) {
            return Ok(false);
        }

        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        if execution.status.is_terminal() {
            return Ok(false);
        }

        execution.status = status;
        execution.error = Some(error);
        execution.finished_at = Some(Utc::now());
        self.store.update_execution(&execution).await?;
        tracing::info!("🧹 Closed orphaned execution {} as {}", execution_id, status);
        Ok(true)
    }

    /// Deliver a human-input payload to a waiting node
    pub fn submit_input(&self, execution_id: &str, node_id: &str, payload: Value) -> Result<bool> {
        let run = self.live_run(execution_id)?;
        if run.definition.node(node_id).is_none() {
            return Err(EngineError::NodeNotFound(node_id.to_string()).into());
        }
        Ok(self.pause.submit_input(execution_id, node_id, payload))
    }

    /// Route a raw transport message (`resume`, `cancel` or JSON) to the
    /// matching control operation
    ///
    /// A JSON payload goes to `node_id` as human input, or resumes breakpoint
    /// waiters with it as modifications when no node is named.
    pub async fn publish(&self, execution_id: &str, node_id: Option<&str>, raw: &str) -> Result<usize> {
        self.live_run(execution_id)?;
        match (PauseSignal::parse(raw)?, node_id) {
            (PauseSignal::Resume { .. }, _) => self.resume(execution_id, None),
            (PauseSignal::Cancel, _) => self.cancel(execution_id).await,
            (PauseSignal::Input(payload), Some(node_id)) => {
                Ok(usize::from(self.submit_input(execution_id, node_id, payload)?))
            }
            (PauseSignal::Input(payload), None) => self.resume(execution_id, Some(payload)),
        }
    }

    /// Input and run options for re-running a previous execution
    ///
    /// The new run gets `metadata.replayOf`; the original is never reopened.
    pub async fn plan_replay(&self, execution_id: &str, new_execution_id: Option<String>) -> Result<ReplayPlan> {
        let original = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        tracing::info!("🔁 Replaying execution {} of '{}'", execution_id, original.workflow_id);

        Ok(ReplayPlan {
            workflow_id: original.workflow_id,
            input: original.input,
            options: RunOptions {
                execution_id: new_execution_id,
                metadata: Some(json!({ "replayOf": execution_id })),
            },
        })
    }

    /// Run `definition` again with the input of a previous execution
    pub async fn replay(&self, execution_id: &str, definition: Arc<WorkflowDefinition>) -> Result<ExecutionResult> {
        let plan = self.plan_replay(execution_id, None).await?;
        self.run_with(definition, plan.input, plan.options).await
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        self.store.get_execution(execution_id).await
    }

    pub async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>> {
        self.store.list_steps(execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::BuiltinNodeRegistry;
    use crate::store::MemoryExecutionStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Registry with scripted test node types on top of the builtins
    #[derive(Default)]
    struct ScriptedRegistry {
        builtin: BuiltinNodeRegistry,
        calls: Mutex<Vec<String>>,
        attempts: Mutex<HashMap<String, u64>>,
    }

    impl ScriptedRegistry {
        fn calls_to(&self, node_id: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|id| *id == node_id).count()
        }
    }

    #[async_trait]
    impl NodeRegistry for ScriptedRegistry {
        async fn execute(&self, node_type: &str, context: &NodeContext) -> Result<NodeResult> {
            self.calls.lock().unwrap().push(context.node_id.clone());

            if let Some(ms) = context.config.get("delayMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }

            match node_type {
                "test.echo" => {
                    let mut output = context.input.as_object().cloned().unwrap_or_default();
                    if let Some(Value::Object(emit)) = context.config.get("emit") {
                        output.extend(emit.clone());
                    }
                    Ok(NodeResult::success(Value::Object(output)))
                }
                "test.fail" => Ok(NodeResult::failure("boom")),
                "test.flaky" => {
                    let fail_times = context.config.get("failTimes").and_then(Value::as_u64).unwrap_or(0);
                    let attempt = {
                        let mut attempts = self.attempts.lock().unwrap();
                        let counter = attempts.entry(context.node_id.clone()).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    if attempt <= fail_times {
                        Ok(NodeResult::failure(format!("flaky failure #{}", attempt)))
                    } else {
                        Ok(NodeResult::success(json!({ "attempts": attempt })))
                    }
                }
                "test.error" => Err(anyhow::anyhow!("registry exploded")),
                other => self.builtin.execute(other, context).await,
            }
        }
    }

    fn harness(pause_timeout: Duration) -> (Arc<Engine>, Arc<MemoryExecutionStore>, Arc<ScriptedRegistry>) {
        let store = Arc::new(MemoryExecutionStore::new());
        let registry = Arc::new(ScriptedRegistry::default());
        let engine = Engine::new(
            store.clone(),
            registry.clone(),
            Arc::new(PauseHub::new(pause_timeout)),
        );
        (Arc::new(engine), store, registry)
    }

    fn definition(raw: Value) -> Arc<WorkflowDefinition> {
        Arc::new(serde_json::from_value(raw).unwrap())
    }

    async fn wait_for_status(store: &MemoryExecutionStore, execution_id: &str, status: ExecutionStatus) {
        for _ in 0..200 {
            if let Some(execution) = store.get_execution(execution_id).await.unwrap() {
                if execution.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never reached {}", execution_id, status);
    }

    async fn wait_for_pause_at(engine: &Engine, execution_id: &str, node_id: &str) {
        for _ in 0..200 {
            if engine.pause_hub().waiting_nodes(execution_id) == vec![node_id.to_string()] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never paused at {}", execution_id, node_id);
    }

    fn step_for<'a>(steps: &'a [ExecutionStep], node_id: &str) -> &'a ExecutionStep {
        steps.iter().find(|s| s.node_id == node_id).unwrap()
    }

    #[tokio::test]
    async fn test_single_trigger_records_one_step() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let result = engine
            .run(definition(json!({ "id": "wf", "nodes": [{ "id": "t", "type": "trigger.manual" }] })), json!({ "x": 1 }))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let steps = store.list_steps(&result.execution_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_number, 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(result.output.unwrap()["t"], json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_fan_out_passes_output_to_both_successors() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "a", "type": "test.echo", "config": { "emit": { "fromA": true } } },
                        { "id": "b", "type": "test.echo" },
                        { "id": "c", "type": "test.echo" }
                    ],
                    "edges": [{ "source": "a", "target": "b" }, { "source": "a", "target": "c" }]
                })),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let steps = store.list_steps(&result.execution_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(step_for(&steps, "b").input["fromA"], json!(true));
        assert_eq!(step_for(&steps, "c").input["fromA"], json!(true));
    }

    #[tokio::test]
    async fn test_if_routes_to_exactly_one_branch() {
        for (score, taken, skipped) in [(90, "pass", "fail"), (10, "fail", "pass")] {
            let (engine, _, registry) = harness(Duration::from_secs(5));
            let result = engine
                .run(
                    definition(json!({
                        "id": "wf",
                        "nodes": [
                            { "id": "t", "type": "trigger.manual" },
                            { "id": "check", "type": "logic.if", "config": { "condition": "input.score >= 50" } },
                            { "id": "pass", "type": "test.echo" },
                            { "id": "fail", "type": "test.echo" }
                        ],
                        "edges": [
                            { "source": "t", "target": "check" },
                            { "source": "check", "target": "pass", "sourceHandle": "true" },
                            { "source": "check", "target": "fail", "sourceHandle": "false" }
                        ]
                    })),
                    json!({ "score": score }),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(registry.calls_to(taken), 1);
            assert_eq!(registry.calls_to(skipped), 0);
        }
    }

    #[tokio::test]
    async fn test_switch_falls_back_to_default() {
        let (engine, _, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [
                { "id": "route", "type": "logic.switch", "config": { "value": "$.tier" } },
                { "id": "gold", "type": "test.echo" },
                { "id": "other", "type": "test.echo" }
            ],
            "edges": [
                { "source": "route", "target": "gold", "sourceHandle": "gold" },
                { "source": "route", "target": "other", "sourceHandle": "default" }
            ]
        }));

        engine.run(workflow.clone(), json!({ "tier": "gold" })).await.unwrap();
        engine.run(workflow, json!({ "tier": "bronze" })).await.unwrap();

        assert_eq!(registry.calls_to("gold"), 1);
        assert_eq!(registry.calls_to("other"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_merge_fires_once_after_all_predecessors() {
        for delays in [[30, 5, 60], [60, 30, 5], [5, 5, 5]] {
            let (engine, store, registry) = harness(Duration::from_secs(5));
            let result = engine
                .run(
                    definition(json!({
                        "id": "wf",
                        "nodes": [
                            { "id": "t", "type": "trigger.manual" },
                            { "id": "a", "type": "test.echo", "config": { "delayMs": delays[0], "emit": { "a": 1 } } },
                            { "id": "b", "type": "test.echo", "config": { "delayMs": delays[1], "emit": { "b": 2 } } },
                            { "id": "c", "type": "test.echo", "config": { "delayMs": delays[2], "emit": { "c": 3 } } },
                            { "id": "m", "type": "logic.merge" },
                            { "id": "after", "type": "test.echo" }
                        ],
                        "edges": [
                            { "source": "t", "target": "a" },
                            { "source": "t", "target": "b" },
                            { "source": "t", "target": "c" },
                            { "source": "a", "target": "m" },
                            { "source": "b", "target": "m" },
                            { "source": "c", "target": "m" },
                            { "source": "m", "target": "after" }
                        ]
                    })),
                    json!({}),
                )
                .await
                .unwrap();

            assert_eq!(result.status, ExecutionStatus::Completed);
            assert_eq!(registry.calls_to("m"), 1);
            assert_eq!(registry.calls_to("after"), 1);

            let steps = store.list_steps(&result.execution_id).await.unwrap();
            assert_eq!(steps.len(), 6);
            let merge_input = &step_for(&steps, "m").input;
            assert_eq!(merge_input["a"], json!(1));
            assert_eq!(merge_input["b"], json!(2));
            assert_eq!(merge_input["c"], json!(3));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_step_numbers_unique_under_fan_out() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let mut nodes = vec![json!({ "id": "t", "type": "trigger.manual" })];
        let mut edges = Vec::new();
        for i in 0..20 {
            nodes.push(json!({ "id": format!("n{}", i), "type": "test.echo" }));
            edges.push(json!({ "source": "t", "target": format!("n{}", i) }));
        }

        let result = engine
            .run(definition(json!({ "id": "wf", "nodes": nodes, "edges": edges })), json!({}))
            .await
            .unwrap();

        let numbers: Vec<i64> = store
            .list_steps(&result.execution_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(numbers, (1..=21).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_retry_records_attempts_and_waits() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let started = Instant::now();
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [{
                        "id": "flaky",
                        "type": "test.flaky",
                        "config": {
                            "failTimes": 2,
                            "retry": { "enabled": true, "maxAttempts": 3, "backoff": "fixed", "delay": 100 }
                        }
                    }]
                })),
                json!({}),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(result.status, ExecutionStatus::Completed);
        let steps = store.list_steps(&result.execution_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].retry_attempt, 2);
    }

    #[tokio::test]
    async fn test_error_edge_routes_only_failure_path() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "t", "type": "trigger.manual" },
                        { "id": "f", "type": "test.fail" },
                        { "id": "ok", "type": "test.echo" },
                        { "id": "handler", "type": "test.echo" }
                    ],
                    "edges": [
                        { "source": "t", "target": "f" },
                        { "source": "f", "target": "ok" },
                        { "source": "f", "target": "handler", "sourceHandle": "error" }
                    ]
                })),
                json!({ "order": 7 }),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("ok"), 0);
        assert_eq!(registry.calls_to("handler"), 1);

        let steps = store.list_steps(&result.execution_id).await.unwrap();
        let handler_input = &step_for(&steps, "handler").input;
        assert_eq!(handler_input["failedNodeId"], json!("f"));
        assert_eq!(handler_input["error"], json!("boom"));
        assert_eq!(handler_input["originalInput"]["order"], json!(7));
        assert_eq!(step_for(&steps, "f").status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_without_handler_ends_only_its_branch() {
        let (engine, _, registry) = harness(Duration::from_secs(5));
        let workflow = |continue_on_error: bool| {
            definition(json!({
                "id": "wf",
                "nodes": [
                    { "id": "t", "type": "trigger.manual" },
                    { "id": "f", "type": "test.error" },
                    { "id": "after", "type": "test.echo" },
                    { "id": "sibling", "type": "test.echo" }
                ],
                "edges": [
                    { "source": "t", "target": "f" },
                    { "source": "t", "target": "sibling" },
                    { "source": "f", "target": "after" }
                ],
                "settings": { "errorHandling": { "continueOnError": continue_on_error } }
            }))
        };

        let result = engine.run(workflow(false), json!({})).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("sibling"), 1);
        assert_eq!(registry.calls_to("after"), 0);

        engine.run(workflow(true), json!({})).await.unwrap();
        assert_eq!(registry.calls_to("after"), 1);
    }

    #[tokio::test]
    async fn test_breakpoint_pauses_until_resume() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [
                { "id": "t", "type": "trigger.manual" },
                { "id": "a", "type": "test.echo", "breakpoint": true }
            ],
            "edges": [{ "source": "t", "target": "a" }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-bp".into()), metadata: None })
                    .await
            })
        };

        wait_for_status(&store, "exec-bp", ExecutionStatus::Paused).await;
        wait_for_pause_at(&engine, "exec-bp", "a").await;
        assert_eq!(registry.calls_to("a"), 0);
        let paused = store.get_execution("exec-bp").await.unwrap().unwrap();
        assert_eq!(paused.metadata["debug"]["pausedAt"], json!("a"));

        assert_eq!(engine.resume("exec-bp", Some(json!({ "patched": true }))).unwrap(), 1);
        let result = run.await.unwrap().unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let steps = store.list_steps("exec-bp").await.unwrap();
        let step = step_for(&steps, "a");
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.input["patched"], json!(true));
    }

    #[tokio::test]
    async fn test_step_mode_pauses_before_every_node() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [
                { "id": "t", "type": "trigger.manual" },
                { "id": "a", "type": "test.echo" }
            ],
            "edges": [{ "source": "t", "target": "a" }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(
                        workflow,
                        json!({}),
                        RunOptions {
                            execution_id: Some("exec-step".into()),
                            metadata: Some(json!({ "debug": { "stepMode": true } })),
                        },
                    )
                    .await
            })
        };

        wait_for_pause_at(&engine, "exec-step", "t").await;
        assert!(engine.step("exec-step").unwrap());
        wait_for_pause_at(&engine, "exec-step", "a").await;
        assert_eq!(registry.calls_to("a"), 0);
        assert!(engine.step("exec-step").unwrap());

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(store.list_steps("exec-step").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [{ "id": "a", "type": "test.echo", "breakpoint": true }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-cancel".into()), metadata: None })
                    .await
            })
        };

        wait_for_pause_at(&engine, "exec-cancel", "a").await;
        assert_eq!(engine.cancel("exec-cancel").await.unwrap(), 1);

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(registry.calls_to("a"), 0);
        let stored = store.get_execution("exec-cancel").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_delay() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [{
                "id": "a",
                "type": "test.fail",
                "config": { "retry": { "enabled": true, "maxAttempts": 2, "backoff": "fixed", "delay": 3000 } }
            }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-retry".into()), metadata: None })
                    .await
            })
        };

        for _ in 0..200 {
            if registry.calls_to("a") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled_at = Instant::now();
        assert_eq!(engine.cancel("exec-retry").await.unwrap(), 0);
        let result = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap().unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(registry.calls_to("a"), 1);
        let steps = store.list_steps("exec-retry").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_pause_timeout_fails_execution() {
        let (engine, store, _) = harness(Duration::from_millis(50));
        let result = engine
            .run(
                definition(json!({ "id": "wf", "nodes": [{ "id": "a", "type": "test.echo", "breakpoint": true }] })),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
        let steps = store.list_steps(&result.execution_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_human_input_becomes_node_output() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [
                { "id": "t", "type": "trigger.manual" },
                { "id": "approve", "type": "human.input" },
                { "id": "after", "type": "test.echo" }
            ],
            "edges": [{ "source": "t", "target": "approve" }, { "source": "approve", "target": "after" }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({ "request": 1 }), RunOptions { execution_id: Some("exec-h".into()), metadata: None })
                    .await
            })
        };

        wait_for_pause_at(&engine, "exec-h", "approve").await;
        assert_eq!(engine.resume("exec-h", None).unwrap(), 0);
        assert!(engine.submit_input("exec-h", "approve", json!({ "approved": true })).unwrap());

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        let steps = store.list_steps("exec-h").await.unwrap();
        let after = &step_for(&steps, "after").input;
        assert_eq!(after["approved"], json!(true));
        assert_eq!(after["request"], json!(1));
    }

    #[tokio::test]
    async fn test_foreach_loop_runs_body_per_item() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "each", "type": "logic.loop.foreach", "config": { "items": "$.orders" } },
                        { "id": "body", "type": "code.lua", "config": { "script": "return { doubled = input.item * 2 }" } },
                        { "id": "after", "type": "test.echo" }
                    ],
                    "edges": [
                        { "source": "each", "target": "body", "sourceHandle": "body" },
                        { "source": "each", "target": "after" }
                    ]
                })),
                json!({ "orders": [1, 2, 3] }),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("body"), 3);
        assert_eq!(registry.calls_to("after"), 1);

        let steps = store.list_steps(&result.execution_id).await.unwrap();
        let loop_step = step_for(&steps, "each");
        assert_eq!(loop_step.output.as_ref().unwrap()["count"], json!(3));
        assert_eq!(
            loop_step.output.as_ref().unwrap()["results"],
            json!([{ "doubled": 2 }, { "doubled": 4 }, { "doubled": 6 }])
        );
        let body_steps: Vec<_> = steps.iter().filter(|s| s.node_id == "body").collect();
        assert!(body_steps.iter().all(|s| s.parent_step_id.as_deref() == Some(loop_step.id.as_str())));
        assert_eq!(step_for(&steps, "after").input["count"], json!(3));
    }

    #[tokio::test]
    async fn test_for_loop_honours_start_index() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "range", "type": "logic.loop.for", "config": { "count": 2, "startIndex": 5 } },
                        { "id": "body", "type": "code.lua", "config": { "script": "return { i = input.index }" } }
                    ],
                    "edges": [{ "source": "range", "target": "body" }]
                })),
                json!({}),
            )
            .await
            .unwrap();

        let steps = store.list_steps(&result.execution_id).await.unwrap();
        let output = step_for(&steps, "range").output.clone().unwrap();
        assert_eq!(output["results"], json!([{ "i": 5 }, { "i": 6 }]));
    }

    #[tokio::test]
    async fn test_while_loop_guard_fails_loop_node() {
        let (engine, store, registry) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "spin", "type": "logic.loop.while", "config": { "condition": "true" } },
                        { "id": "body", "type": "test.echo" },
                        { "id": "after", "type": "test.echo" }
                    ],
                    "edges": [
                        { "source": "spin", "target": "body", "sourceHandle": "body" },
                        { "source": "spin", "target": "after" }
                    ],
                    "settings": { "maxLoopIterations": 5 }
                })),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("body"), 5);
        assert_eq!(registry.calls_to("after"), 0);
        let steps = store.list_steps(&result.execution_id).await.unwrap();
        let spin = step_for(&steps, "spin");
        assert_eq!(spin.status, StepStatus::Failed);
        assert!(spin.error.as_ref().unwrap().contains("iteration limit"));
    }

    #[tokio::test]
    async fn test_while_loop_stops_on_condition() {
        let (engine, _, registry) = harness(Duration::from_secs(5));
        engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "spin", "type": "logic.loop.while", "config": { "condition": "index < 3" } },
                        { "id": "body", "type": "test.echo" }
                    ],
                    "edges": [{ "source": "spin", "target": "body" }]
                })),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(registry.calls_to("body"), 3);
    }

    #[tokio::test]
    async fn test_cyclic_graph_falls_back_to_first_node() {
        let (engine, _, registry) = harness(Duration::from_secs(5));
        let result = engine
            .run(
                definition(json!({
                    "id": "wf",
                    "nodes": [
                        { "id": "a", "type": "logic.if", "config": { "condition": false } },
                        { "id": "b", "type": "test.echo" }
                    ],
                    "edges": [
                        { "source": "a", "target": "b", "sourceHandle": "true" },
                        { "source": "b", "target": "a" },
                        { "source": "a", "target": "ghost" }
                    ]
                })),
                json!({}),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("a"), 1);
        assert_eq!(registry.calls_to("b"), 0);
    }

    #[tokio::test]
    async fn test_replay_creates_new_execution() {
        let (engine, store, _) = harness(Duration::from_secs(5));
        let workflow = definition(json!({ "id": "wf", "nodes": [{ "id": "t", "type": "trigger.manual" }] }));

        let first = engine.run(workflow.clone(), json!({ "seed": 42 })).await.unwrap();
        let replayed = engine.replay(&first.execution_id, workflow).await.unwrap();

        assert_ne!(first.execution_id, replayed.execution_id);
        let stored = store.get_execution(&replayed.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.metadata["replayOf"], json!(first.execution_id));
        assert_eq!(stored.input, json!({ "seed": 42 }));

        let original = store.get_execution(&first.execution_id).await.unwrap().unwrap();
        assert_eq!(original.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_controls_reject_unknown_execution() {
        let (engine, _, _) = harness(Duration::from_secs(5));
        assert!(engine.resume("missing", None).is_err());
        assert!(engine.step("missing").is_err());
        assert!(engine.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_routes_raw_tokens() {
        let (engine, _, registry) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [
                { "id": "gate", "type": "test.echo", "breakpoint": true },
                { "id": "approve", "type": "human.input" }
            ],
            "edges": [{ "source": "gate", "target": "approve" }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-raw".into()), metadata: None })
                    .await
            })
        };

        wait_for_pause_at(&engine, "exec-raw", "gate").await;
        assert!(engine.publish("exec-raw", None, "bogus").await.is_err());
        assert_eq!(engine.publish("exec-raw", None, "resume").await.unwrap(), 1);

        wait_for_pause_at(&engine, "exec-raw", "approve").await;
        assert_eq!(engine.publish("exec-raw", Some("approve"), r#"{"ok":true}"#).await.unwrap(), 1);

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(registry.calls_to("gate"), 1);
        assert_eq!(result.output.unwrap()["approve"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_publish_cancel_ends_run() {
        let (engine, _, _) = harness(Duration::from_secs(5));
        let workflow = definition(json!({ "id": "wf", "nodes": [{ "id": "approve", "type": "human.input" }] }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-raw-cancel".into()), metadata: None })
                    .await
            })
        };

        wait_for_pause_at(&engine, "exec-raw-cancel", "approve").await;
        assert_eq!(engine.publish("exec-raw-cancel", None, "cancel").await.unwrap(), 1);
        assert_eq!(run.await.unwrap().unwrap().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_submit_input_rejects_unknown_node() {
        let (engine, _, _) = harness(Duration::from_secs(5));
        let workflow = definition(json!({
            "id": "wf",
            "nodes": [{ "id": "approve", "type": "human.input" }]
        }));

        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run_with(workflow, json!({}), RunOptions { execution_id: Some("exec-input".into()), metadata: None })
                    .await
            })
        };
        wait_for_pause_at(&engine, "exec-input", "approve").await;

        let err = engine.submit_input("exec-input", "ghost", json!({})).unwrap_err();
        assert_eq!(EngineError::classify(&err), Some(&EngineError::NodeNotFound("ghost".into())));
        assert!(engine.submit_input("exec-input", "approve", json!({ "ok": true })).unwrap());

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }
}
