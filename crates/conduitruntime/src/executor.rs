use crate::registry::NodeRegistry;
use crate::store::FlowStore;
use chrono::Utc;
use conduitcore::{
    DefinitionError, EventBus, EventScope, Execution, ExecutionEvent, ExecutionStatus, Flow,
    Node, NodeConnection, NodeContext, NodeError, NodeExecution, NodeId, NodeOutput, RetryPolicy,
    Value,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Dependency graph of a flow with a precomputed topological order
pub struct ExecutionGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl ExecutionGraph {
    /// Build the graph from a flow's connections, rejecting cycles
    pub fn build(flow: &Flow) -> Result<Self, DefinitionError> {
        flow.validate()?;

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &flow.nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for conn in &flow.connections {
            let from = index
                .get(&conn.from_node_id)
                .ok_or_else(|| DefinitionError::NodeNotFound(conn.from_node_id.clone()))?;
            let to = index
                .get(&conn.to_node_id)
                .ok_or_else(|| DefinitionError::NodeNotFound(conn.to_node_id.clone()))?;
            graph.add_edge(*from, *to, ());
        }

        let order = toposort(&graph, None)
            .map_err(|_| DefinitionError::CyclicDependency)?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self { graph, index, order })
    }

    /// Node ids in dependency order
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    fn upstream(&self, node_id: &str) -> impl Iterator<Item = &NodeId> + '_ {
        let idx = self.index.get(node_id).copied();
        idx.into_iter().flat_map(move |idx| {
            self.graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(move |dep| &self.graph[dep])
        })
    }

    fn downstream(&self, node_id: &str) -> Vec<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut reached = Vec::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                reached.push(self.graph[idx].clone());
            }
        }
        reached
    }
}

/// Out-of-band control for one running execution. Cancellation and pause are
/// both cooperative: they take effect between node invocations.
pub struct ExecutionControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Waiting,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    TimedOut,
}

struct NodeRun {
    result: Result<NodeOutput, NodeError>,
    attempts: u32,
}

type RunningNode = BoxFuture<'static, (NodeId, Result<NodeRun, JoinError>)>;

/// Per-run inputs handed to the executor by the orchestrator
pub struct RunRequest {
    pub flow: Arc<Flow>,
    pub execution: Execution,
    pub retry: RetryPolicy,
    pub deadline: Option<Duration>,
    pub inputs: HashMap<String, Value>,
    pub control: Arc<ExecutionControl>,
}

/// Mutable bookkeeping for a single execution
struct RunState {
    execution: Execution,
    scope: EventScope,
    nodes: HashMap<NodeId, NodeState>,
    records: HashMap<NodeId, NodeExecution>,
    outputs: HashMap<NodeId, HashMap<String, Value>>,
    running: FuturesUnordered<RunningNode>,
    failure: Option<String>,
    halt: Option<Halt>,
}

impl RunState {
    fn ready_nodes(&self, graph: &ExecutionGraph) -> Vec<NodeId> {
        graph
            .order()
            .iter()
            .filter(|id| self.nodes.get(*id) == Some(&NodeState::Waiting))
            .filter(|id| {
                graph
                    .upstream(id)
                    .all(|dep| self.nodes.get(dep) == Some(&NodeState::Succeeded))
            })
            .cloned()
            .collect()
    }
}

/// Walks a flow's DAG, running independent branches concurrently and joining
/// at nodes with several inbound connections.
pub struct FlowExecutor {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn FlowStore>,
    max_parallel: usize,
    node_timeout: Option<Duration>,
}

impl FlowExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        event_bus: Arc<EventBus>,
        store: Arc<dyn FlowStore>,
        max_parallel: usize,
        node_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            event_bus,
            store,
            max_parallel: max_parallel.max(1),
            node_timeout,
        }
    }

    /// Drive a running execution to a terminal state and return the final record
    pub async fn run(&self, request: RunRequest) -> Execution {
        let RunRequest {
            flow,
            execution,
            retry,
            deadline,
            inputs,
            control,
        } = request;

        let scope = EventScope::new(execution.id)
            .with_flow(flow.id)
            .with_user(execution.user_id.clone());
        let mut state = RunState {
            execution,
            scope,
            nodes: flow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::Waiting))
                .collect(),
            records: HashMap::new(),
            outputs: HashMap::new(),
            running: FuturesUnordered::new(),
            failure: None,
            halt: None,
        };

        let graph = match ExecutionGraph::build(&flow) {
            Ok(graph) => graph,
            Err(e) => {
                state.failure = Some(e.to_string());
                return self.finish(state, deadline).await;
            }
        };

        let deadline_at = deadline.map(|d| Instant::now() + d);
        let mut paused_rx = control.paused.subscribe();

        tracing::info!(
            execution_id = %state.execution.id,
            flow_id = %flow.id,
            nodes = flow.nodes.len(),
            "Starting flow execution"
        );

        loop {
            if state.halt.is_none() {
                if control.is_cancelled() {
                    tracing::info!(execution_id = %state.execution.id, "Cancellation requested");
                    state.halt = Some(Halt::Cancelled);
                } else if deadline_at.is_some_and(|d| Instant::now() >= d) {
                    tracing::warn!(execution_id = %state.execution.id, "Execution deadline exceeded");
                    state.halt = Some(Halt::TimedOut);
                }
            }

            let want_paused = *paused_rx.borrow_and_update();
            if state.halt.is_none() {
                self.apply_pause(&mut state, want_paused).await;
            }

            let paused = state.execution.status == ExecutionStatus::Paused;
            if state.halt.is_none() && !paused {
                self.launch_ready(&mut state, &flow, &graph, &retry, &inputs, &control)
                    .await;
            }

            if state.running.is_empty() {
                if state.halt.is_some() || state.ready_nodes(&graph).is_empty() {
                    break;
                }
                if paused {
                    tokio::select! {
                        _ = paused_rx.changed() => {}
                        _ = control.cancel.cancelled() => {}
                        _ = wait_until(deadline_at) => {}
                    }
                }
                continue;
            }

            let watching = state.halt.is_none();
            tokio::select! {
                Some((node_id, joined)) = state.running.next() => {
                    self.complete_node(&mut state, &graph, node_id, joined).await;
                }
                _ = paused_rx.changed(), if watching => {}
                _ = control.cancel.cancelled(), if watching => {}
                _ = wait_until(deadline_at), if watching => {}
            }
        }

        control.set_paused(false);
        self.finish(state, deadline).await
    }

    async fn apply_pause(&self, state: &mut RunState, want_paused: bool) {
        let status = state.execution.status;
        let (next, event) = match (status, want_paused) {
            (ExecutionStatus::Running, true) => (
                ExecutionStatus::Paused,
                ExecutionEvent::ExecutionPaused {
                    scope: state.scope.clone(),
                    timestamp: Utc::now(),
                },
            ),
            (ExecutionStatus::Paused, false) => (
                ExecutionStatus::Running,
                ExecutionEvent::ExecutionResumed {
                    scope: state.scope.clone(),
                    timestamp: Utc::now(),
                },
            ),
            _ => return,
        };

        if let Err(e) = state.execution.transition(next) {
            tracing::warn!(execution_id = %state.execution.id, error = %e, "Ignoring pause change");
            return;
        }
        tracing::info!(execution_id = %state.execution.id, status = %next, "Execution status changed");
        self.persist_execution(&state.execution).await;
        self.event_bus.emit(event);
    }

    async fn launch_ready(
        &self,
        state: &mut RunState,
        flow: &Flow,
        graph: &ExecutionGraph,
        retry: &RetryPolicy,
        trigger_inputs: &HashMap<String, Value>,
        control: &ExecutionControl,
    ) {
        for node_id in state.ready_nodes(graph) {
            if state.running.len() >= self.max_parallel {
                break;
            }
            let Some(spec) = flow.find_node(&node_id) else {
                continue;
            };

            let mut record =
                NodeExecution::start(state.execution.id, node_id.clone(), spec.node_type.clone());
            state.nodes.insert(node_id.clone(), NodeState::Running);
            self.persist_node(&record).await;
            self.event_bus.emit(ExecutionEvent::NodeStarted {
                scope: state.scope.clone(),
                node_id: node_id.clone(),
                node_type: spec.node_type.clone(),
                timestamp: Utc::now(),
            });

            let node = match self.registry.create(&spec.node_type, &spec.config) {
                Ok(node) => node,
                Err(e) => {
                    let error = e.to_string();
                    tracing::error!(node_id = %node_id, error = %error, "Failed to create node");
                    self.event_bus.emit(ExecutionEvent::NodeFailed {
                        scope: state.scope.clone(),
                        node_id: node_id.clone(),
                        error: error.clone(),
                        attempt: 0,
                        will_retry: false,
                        timestamp: Utc::now(),
                    });
                    record.fail(0, error.clone());
                    self.persist_node(&record).await;
                    state.records.insert(node_id.clone(), record);
                    self.mark_failed(state, graph, &node_id, error);
                    continue;
                }
            };
            state.records.insert(node_id.clone(), record);

            let inputs = self.collect_inputs(state, flow, &node_id, trigger_inputs);
            let ctx = NodeContext {
                execution_id: state.execution.id,
                flow_id: flow.id,
                node_id: node_id.clone(),
                attempt: 1,
                inputs,
                config: spec.config.clone(),
                events: self
                    .event_bus
                    .create_emitter(state.scope.clone(), node_id.clone()),
                cancellation: control.cancel.child_token(),
            };

            let attempt = run_with_retry(
                node,
                ctx,
                *retry,
                self.node_timeout,
                self.event_bus.clone(),
                state.scope.clone(),
            );
            let handle = tokio::spawn(attempt);
            let id = node_id.clone();
            state
                .running
                .push(async move { (id, handle.await) }.boxed());
        }
    }

    /// Bind each inbound connection's upstream output to this node's input.
    /// Nodes without inbound connections receive the trigger inputs.
    fn collect_inputs(
        &self,
        state: &RunState,
        flow: &Flow,
        node_id: &str,
        trigger_inputs: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let inbound: Vec<&NodeConnection> = flow.inbound(node_id).collect();
        if inbound.is_empty() {
            return trigger_inputs.clone();
        }

        let mut inputs = HashMap::new();
        for conn in inbound {
            let value = state
                .outputs
                .get(&conn.from_node_id)
                .and_then(|outputs| outputs.get(&conn.from_output));

            match value {
                Some(value) => {
                    self.event_bus.emit(ExecutionEvent::DataPassed {
                        scope: state.scope.clone(),
                        connection: conn.clone(),
                        records: value.record_count(),
                        timestamp: Utc::now(),
                    });
                    inputs.insert(conn.to_input.clone(), value.clone());
                }
                None => {
                    tracing::warn!(
                        from = %conn.from_node_id,
                        output = %conn.from_output,
                        to = %conn.to_node_id,
                        "Upstream output missing"
                    );
                    self.event_bus.emit(ExecutionEvent::DataError {
                        scope: state.scope.clone(),
                        connection: conn.clone(),
                        error: format!(
                            "Node {} produced no output '{}'",
                            conn.from_node_id, conn.from_output
                        ),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
        inputs
    }

    async fn complete_node(
        &self,
        state: &mut RunState,
        graph: &ExecutionGraph,
        node_id: NodeId,
        joined: Result<NodeRun, JoinError>,
    ) {
        let run = joined.unwrap_or_else(|e| NodeRun {
            result: Err(NodeError::ExecutionFailed(format!("node task aborted: {}", e))),
            attempts: 1,
        });
        let Some(record) = state.records.get_mut(&node_id) else {
            return;
        };

        match run.result {
            Ok(output) => {
                record.succeed(run.attempts, output.records_processed);
                tracing::info!(
                    node_id = %node_id,
                    attempts = run.attempts,
                    duration_ms = record.duration_ms(),
                    "Node completed"
                );
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    scope: state.scope.clone(),
                    node_id: node_id.clone(),
                    outputs: output.outputs.clone(),
                    records_processed: output.records_processed,
                    attempts: run.attempts,
                    duration_ms: record.duration_ms(),
                    timestamp: Utc::now(),
                });
                let record = record.clone();
                self.persist_node(&record).await;
                state.outputs.insert(node_id.clone(), output.outputs);
                state.nodes.insert(node_id, NodeState::Succeeded);
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(node_id = %node_id, attempts = run.attempts, error = %error, "Node failed");
                record.fail(run.attempts, error.clone());
                let record = record.clone();
                self.persist_node(&record).await;
                self.mark_failed(state, graph, &node_id, error);
            }
        }
    }

    fn mark_failed(&self, state: &mut RunState, graph: &ExecutionGraph, node_id: &str, error: String) {
        state.nodes.insert(node_id.to_string(), NodeState::Failed);
        for skipped in graph.downstream(node_id) {
            if state.nodes.get(&skipped) == Some(&NodeState::Waiting) {
                tracing::debug!(node_id = %skipped, upstream = %node_id, "Skipping downstream node");
                state.nodes.insert(skipped, NodeState::Skipped);
            }
        }
        state.failure.get_or_insert(error);
    }

    async fn finish(&self, mut state: RunState, deadline: Option<Duration>) -> Execution {
        let target = match state.halt {
            Some(Halt::Cancelled) => ExecutionStatus::Cancelled,
            Some(Halt::TimedOut) => ExecutionStatus::Timeout,
            None if state.failure.is_some() => ExecutionStatus::Failed,
            None => ExecutionStatus::Success,
        };

        // A paused execution whose last in-flight node returns is resumed to settle.
        if !state.execution.status.can_transition_to(target) {
            self.apply_pause(&mut state, false).await;
        }

        let execution = &mut state.execution;
        execution.records_processed = state
            .records
            .values()
            .filter(|r| r.status == conduitcore::NodeExecutionStatus::Success)
            .map(|r| r.records_processed)
            .sum();
        execution.error_message = match target {
            ExecutionStatus::Failed => state.failure.clone(),
            ExecutionStatus::Timeout => Some(format!(
                "Execution exceeded timeout of {}ms",
                deadline.map(|d| d.as_millis()).unwrap_or_default()
            )),
            _ => None,
        };

        if let Err(e) = execution.transition(target) {
            tracing::error!(execution_id = %execution.id, error = %e, "Invalid terminal transition");
        }
        self.persist_execution(execution).await;

        let duration_ms = execution.duration_ms.unwrap_or_default();
        let scope = state.scope.clone();
        let event = match execution.status {
            ExecutionStatus::Success => ExecutionEvent::ExecutionCompleted {
                scope,
                records_processed: execution.records_processed,
                duration_ms,
                timestamp: Utc::now(),
            },
            ExecutionStatus::Cancelled => ExecutionEvent::ExecutionCancelled {
                scope,
                timestamp: Utc::now(),
            },
            ExecutionStatus::Timeout => ExecutionEvent::ExecutionTimedOut {
                scope,
                timeout_ms: deadline.map(|d| d.as_millis() as u64).unwrap_or_default(),
                timestamp: Utc::now(),
            },
            _ => ExecutionEvent::ExecutionFailed {
                scope,
                error: execution.error_message.clone().unwrap_or_default(),
                duration_ms,
                timestamp: Utc::now(),
            },
        };

        tracing::info!(
            execution_id = %execution.id,
            status = %execution.status,
            records = execution.records_processed,
            duration_ms,
            "Flow execution finished"
        );
        self.event_bus.emit(event);
        state.execution
    }

    async fn persist_execution(&self, execution: &Execution) {
        if let Err(e) = self.store.save_execution(execution).await {
            tracing::warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    async fn persist_node(&self, record: &NodeExecution) {
        if let Err(e) = self.store.save_node_execution(record).await {
            tracing::warn!(node_id = %record.node_id, error = %e, "Failed to persist node execution");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run one node, retrying failed attempts with a fixed delay. The wait
/// between attempts ends early if the execution is cancelled.
async fn run_with_retry(
    node: Box<dyn Node>,
    ctx: NodeContext,
    policy: RetryPolicy,
    node_timeout: Option<Duration>,
    event_bus: Arc<EventBus>,
    scope: EventScope,
) -> NodeRun {
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        let mut attempt_ctx = ctx.clone();
        attempt_ctx.attempt = attempt;

        let result = match node.validate(&attempt_ctx.inputs) {
            Err(e) => Err(e),
            Ok(()) => match node_timeout {
                Some(limit) => timeout(limit, node.execute(attempt_ctx))
                    .await
                    .unwrap_or_else(|_| {
                        Err(NodeError::Timeout {
                            ms: limit.as_millis() as u64,
                        })
                    }),
                None => node.execute(attempt_ctx).await,
            },
        };

        let error = match result {
            Ok(output) => {
                return NodeRun {
                    result: Ok(output),
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        let will_retry = attempt < max_attempts && !ctx.cancellation.is_cancelled();
        event_bus.emit(ExecutionEvent::NodeFailed {
            scope: scope.clone(),
            node_id: ctx.node_id.clone(),
            error: error.to_string(),
            attempt,
            will_retry,
            timestamp: Utc::now(),
        });

        if !will_retry {
            return NodeRun {
                result: Err(error),
                attempts: attempt,
            };
        }

        tracing::warn!(
            node_id = %ctx.node_id,
            attempt,
            max_attempts,
            error = %error,
            "Node attempt failed, retrying"
        );

        tokio::select! {
            _ = sleep(policy.retry_delay()) => {}
            _ = ctx.cancellation.cancelled() => {
                return NodeRun {
                    result: Err(error),
                    attempts: attempt,
                };
            }
        }
        attempt += 1;
    }
}
