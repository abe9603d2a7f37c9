use async_trait::async_trait;
use conduitcore::{
    Execution, ExecutionId, Flow, FlowError, FlowId, NodeExecution, NodeId, Schedule, ScheduleId,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence boundary for flows, schedules and execution records.
///
/// The orchestrator reads and writes exclusively through this trait.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn save_flow(&self, flow: &Flow) -> Result<(), FlowError>;

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, FlowError>;

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), FlowError>;

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, FlowError>;

    /// Insert or replace an execution record
    async fn save_execution(&self, execution: &Execution) -> Result<(), FlowError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, FlowError>;

    async fn list_executions(&self, flow_id: FlowId) -> Result<Vec<Execution>, FlowError>;

    /// Insert or replace the record for `(execution_id, node_id)`
    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), FlowError>;

    async fn list_node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecution>, FlowError>;
}

/// In-memory store for tests, the CLI and single-process embedding
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<HashMap<FlowId, Flow>>,
    schedules: RwLock<HashMap<ScheduleId, Schedule>>,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
    node_executions: RwLock<HashMap<ExecutionId, HashMap<NodeId, NodeExecution>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn save_flow(&self, flow: &Flow) -> Result<(), FlowError> {
        self.flows.write().await.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<Flow>, FlowError> {
        Ok(self.flows.read().await.get(&id).cloned())
    }

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), FlowError> {
        self.schedules.write().await.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, FlowError> {
        Ok(self.schedules.read().await.get(&id).cloned())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), FlowError> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<Execution>, FlowError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_executions(&self, flow_id: FlowId) -> Result<Vec<Execution>, FlowError> {
        let mut executions: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.flow_id == flow_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.start_time);
        Ok(executions)
    }

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), FlowError> {
        self.node_executions
            .write()
            .await
            .entry(record.execution_id)
            .or_default()
            .insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: ExecutionId) -> Result<Vec<NodeExecution>, FlowError> {
        let mut records: Vec<NodeExecution> = self
            .node_executions
            .read()
            .await
            .get(&execution_id)
            .map(|by_node| by_node.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.start_time);
        Ok(records)
    }
}
