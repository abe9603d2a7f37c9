use crate::executor::{ExecutionControl, ExecutionGraph, FlowExecutor, RunRequest};
use crate::registry::NodeRegistry;
use crate::runtime::RuntimeConfig;
use crate::store::FlowStore;
use chrono::Utc;
use conduitcore::{
    EventBus, EventScope, Execution, ExecutionEvent, ExecutionId, ExecutionStatus, Flow,
    FlowError, NodeExecution, RetryPolicy, Trigger, TriggerKind,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle to a started execution
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    completion: JoinHandle<Execution>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal state
    pub async fn wait(self) -> Result<Execution, FlowError> {
        self.completion
            .await
            .map_err(|e| FlowError::Execution(format!("execution task failed: {}", e)))
    }
}

/// Starts executions and routes cancel, pause and resume requests to them.
///
/// Every execution runs on its own task. Two executions share nothing but
/// the registry, the store and the event bus.
pub struct ExecutionOrchestrator {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn FlowStore>,
    executor: Arc<FlowExecutor>,
    default_retry: RetryPolicy,
    active: Arc<DashMap<ExecutionId, Arc<ExecutionControl>>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        event_bus: Arc<EventBus>,
        store: Arc<dyn FlowStore>,
        config: &RuntimeConfig,
    ) -> Self {
        let executor = Arc::new(FlowExecutor::new(
            registry.clone(),
            event_bus.clone(),
            store.clone(),
            config.max_parallel_nodes,
            config.node_timeout(),
        ));

        Self {
            registry,
            event_bus,
            store,
            executor,
            default_retry: config.default_retry,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Create an execution for `flow` and start running it in the background.
    ///
    /// Structural problems (cycles, dangling connections, unregistered node
    /// types) are reported here and no execution record is created.
    pub async fn start_execution(
        &self,
        flow: &Flow,
        trigger: Trigger,
    ) -> Result<ExecutionHandle, FlowError> {
        self.launch(flow, trigger, None).await
    }

    /// Start a fresh execution of a failed execution's flow. Orchestration
    /// begins again from the first node.
    pub async fn retry_execution(&self, id: ExecutionId) -> Result<ExecutionHandle, FlowError> {
        let previous = self.load(id).await?;
        if previous.status != ExecutionStatus::Failed {
            return Err(FlowError::InvalidState {
                execution_id: id,
                action: "retry",
                status: previous.status.to_string(),
            });
        }

        let flow = self
            .store
            .get_flow(previous.flow_id)
            .await?
            .ok_or(FlowError::FlowNotFound(previous.flow_id))?;

        let schedule = match previous.schedule_id {
            Some(schedule_id) => self.store.get_schedule(schedule_id).await?,
            None => None,
        };
        let mut trigger = match schedule {
            Some(schedule) => Trigger::scheduled(schedule),
            None => Trigger::manual(),
        };
        trigger.kind = TriggerKind::Retry;
        trigger.user_id = previous.user_id.clone();
        trigger.inputs = previous.inputs.clone();

        tracing::info!(
            previous_execution_id = %id,
            retry_count = previous.retry_count + 1,
            "Retrying failed execution"
        );
        self.launch(&flow, trigger, Some(&previous)).await
    }

    /// Request cooperative cancellation. In-flight nodes run to completion;
    /// nothing new is started.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<(), FlowError> {
        let mut execution = self.load(id).await?;
        if !matches!(
            execution.status,
            ExecutionStatus::Running | ExecutionStatus::Paused
        ) {
            return Err(FlowError::InvalidState {
                execution_id: id,
                action: "cancel",
                status: execution.status.to_string(),
            });
        }

        match self.control(id) {
            Some(control) => {
                tracing::info!(execution_id = %id, "Cancelling execution");
                control.cancel();
            }
            None => {
                // Record says live but no task owns it here; settle it directly.
                tracing::warn!(execution_id = %id, "Cancelling orphaned execution record");
                execution.transition(ExecutionStatus::Cancelled)?;
                self.store.save_execution(&execution).await?;
                self.event_bus.emit(ExecutionEvent::ExecutionCancelled {
                    scope: scope_of(&execution),
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(())
    }

    /// Stop launching new nodes until resumed
    pub async fn pause_execution(&self, id: ExecutionId) -> Result<(), FlowError> {
        match self.control(id) {
            Some(control) if !control.is_cancelled() && !control.is_paused() => {
                tracing::info!(execution_id = %id, "Pausing execution");
                control.set_paused(true);
                Ok(())
            }
            _ => Err(self.invalid_state(id, "pause").await),
        }
    }

    pub async fn resume_execution(&self, id: ExecutionId) -> Result<(), FlowError> {
        match self.control(id) {
            Some(control) if !control.is_cancelled() && control.is_paused() => {
                tracing::info!(execution_id = %id, "Resuming execution");
                control.set_paused(false);
                Ok(())
            }
            _ => Err(self.invalid_state(id, "resume").await),
        }
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        self.load(id).await
    }

    pub async fn node_executions(&self, id: ExecutionId) -> Result<Vec<NodeExecution>, FlowError> {
        self.store.list_node_executions(id).await
    }

    /// Number of executions currently owned by this orchestrator
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    async fn launch(
        &self,
        flow: &Flow,
        trigger: Trigger,
        retry_of: Option<&Execution>,
    ) -> Result<ExecutionHandle, FlowError> {
        ExecutionGraph::build(flow)?;
        if let Some(missing) = flow
            .nodes
            .iter()
            .find(|node| !self.registry.contains(&node.node_type))
        {
            return Err(FlowError::NodeTypeNotFound(missing.node_type.clone()));
        }

        // Retries reload both by id.
        if let Some(schedule) = &trigger.schedule {
            self.store.save_schedule(schedule).await?;
        }
        self.store.save_flow(flow).await?;

        let mut execution = Execution::new(flow.id, &trigger);
        if let Some(previous) = retry_of {
            execution.retry_count = previous.retry_count + 1;
            execution.retry_of = Some(previous.id);
        }
        self.store.save_execution(&execution).await?;

        execution.transition(ExecutionStatus::Running)?;
        self.store.save_execution(&execution).await?;

        let execution_id = execution.id;
        let control = Arc::new(ExecutionControl::new());
        self.active.insert(execution_id, control.clone());

        tracing::info!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            trigger = ?trigger.kind,
            "Execution started"
        );
        self.event_bus.emit(ExecutionEvent::ExecutionStarted {
            scope: scope_of(&execution),
            trigger: trigger.kind,
            timestamp: Utc::now(),
        });

        let request = RunRequest {
            flow: Arc::new(flow.clone()),
            execution,
            retry: trigger.retry_policy(self.default_retry),
            deadline: trigger.timeout(),
            inputs: trigger.inputs,
            control,
        };

        let executor = self.executor.clone();
        let active = self.active.clone();
        let completion = tokio::spawn(async move {
            let finished = executor.run(request).await;
            active.remove(&execution_id);
            finished
        });

        Ok(ExecutionHandle {
            execution_id,
            completion,
        })
    }

    fn control(&self, id: ExecutionId) -> Option<Arc<ExecutionControl>> {
        self.active.get(&id).map(|entry| entry.value().clone())
    }

    async fn load(&self, id: ExecutionId) -> Result<Execution, FlowError> {
        self.store
            .get_execution(id)
            .await?
            .ok_or(FlowError::ExecutionNotFound(id))
    }

    async fn invalid_state(&self, id: ExecutionId, action: &'static str) -> FlowError {
        match self.load(id).await {
            Ok(execution) => FlowError::InvalidState {
                execution_id: id,
                action,
                status: execution.status.to_string(),
            },
            Err(e) => e,
        }
    }
}

fn scope_of(execution: &Execution) -> EventScope {
    EventScope::new(execution.id)
        .with_flow(execution.flow_id)
        .with_user(execution.user_id.clone())
}
