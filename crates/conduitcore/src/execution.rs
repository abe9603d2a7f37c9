//! Execution records and their status lifecycle.
//!
//! ```text
//! pending -> running -> { success, failed, cancelled, timeout }
//!            running <-> paused
//! ```
//! A paused execution may also be cancelled or time out.

use crate::{FlowError, FlowId, NodeId, ScheduleId, Trigger, TriggerKind, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type ExecutionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Timeout)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Paused, Timeout)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub schedule_id: Option<ScheduleId>,
    pub trigger: TriggerKind,
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub records_processed: u64,
    /// Execution-level retries that led to this run
    pub retry_count: u32,
    pub retry_of: Option<ExecutionId>,
    pub error_message: Option<String>,
    /// Trigger inputs, replayed when the execution is retried
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

impl Execution {
    pub fn new(flow_id: FlowId, trigger: &Trigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            schedule_id: trigger.schedule_id(),
            trigger: trigger.kind,
            user_id: trigger.user_id.clone(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            records_processed: 0,
            retry_count: 0,
            retry_of: None,
            error_message: None,
            inputs: trigger.inputs.clone(),
        }
    }

    /// Move forward through the lifecycle, stamping end time and duration on
    /// terminal transitions.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), FlowError> {
        if !self.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            let end = Utc::now();
            let elapsed = (end - self.start_time).num_milliseconds().max(0) as u64;
            self.end_time = Some(end);
            self.duration_ms = Some(elapsed);
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionStatus {
    Running,
    Success,
    Failed,
}

impl NodeExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeExecutionStatus::Running => "running",
            NodeExecutionStatus::Success => "success",
            NodeExecutionStatus::Failed => "failed",
        }
    }
}

/// Record of one node instance within one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub records_processed: u64,
    pub error_message: Option<String>,
}

impl NodeExecution {
    pub fn start(execution_id: ExecutionId, node_id: NodeId, node_type: String) -> Self {
        Self {
            execution_id,
            node_id,
            node_type,
            status: NodeExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            attempts: 0,
            records_processed: 0,
            error_message: None,
        }
    }

    pub fn succeed(&mut self, attempts: u32, records_processed: u64) {
        self.status = NodeExecutionStatus::Success;
        self.attempts = attempts;
        self.records_processed = records_processed;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, attempts: u32, error: impl Into<String>) {
        self.status = NodeExecutionStatus::Failed;
        self.attempts = attempts;
        self.error_message = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}
