use crate::{ExecutionId, FlowId, NodeConnection, NodeId, TriggerKind, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Identifiers an event is addressed by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    pub execution_id: ExecutionId,
    pub flow_id: Option<FlowId>,
    pub user_id: Option<String>,
}

impl EventScope {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            flow_id: None,
            user_id: None,
        }
    }

    pub fn with_flow(mut self, flow_id: FlowId) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Domain events published by the orchestrator. The set is closed; observers
/// match on the variant rather than on strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        #[serde(flatten)]
        scope: EventScope,
        trigger: TriggerKind,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        #[serde(flatten)]
        scope: EventScope,
        records_processed: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ExecutionFailed {
        #[serde(flatten)]
        scope: EventScope,
        error: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        #[serde(flatten)]
        scope: EventScope,
        timestamp: DateTime<Utc>,
    },
    ExecutionTimedOut {
        #[serde(flatten)]
        scope: EventScope,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ExecutionPaused {
        #[serde(flatten)]
        scope: EventScope,
        timestamp: DateTime<Utc>,
    },
    ExecutionResumed {
        #[serde(flatten)]
        scope: EventScope,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        #[serde(flatten)]
        scope: EventScope,
        node_id: NodeId,
        node_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        #[serde(flatten)]
        scope: EventScope,
        node_id: NodeId,
        outputs: HashMap<String, Value>,
        records_processed: u64,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        #[serde(flatten)]
        scope: EventScope,
        node_id: NodeId,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    NodeProgress {
        #[serde(flatten)]
        scope: EventScope,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
    DataPassed {
        #[serde(flatten)]
        scope: EventScope,
        connection: NodeConnection,
        records: u64,
        timestamp: DateTime<Utc>,
    },
    DataError {
        #[serde(flatten)]
        scope: EventScope,
        connection: NodeConnection,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Dotted event name, e.g. `execution.node.started`
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "execution.started",
            ExecutionEvent::ExecutionCompleted { .. } => "execution.completed",
            ExecutionEvent::ExecutionFailed { .. } => "execution.failed",
            ExecutionEvent::ExecutionCancelled { .. } => "execution.cancelled",
            ExecutionEvent::ExecutionTimedOut { .. } => "execution.timeout",
            ExecutionEvent::ExecutionPaused { .. } => "execution.paused",
            ExecutionEvent::ExecutionResumed { .. } => "execution.resumed",
            ExecutionEvent::NodeStarted { .. } => "execution.node.started",
            ExecutionEvent::NodeCompleted { .. } => "execution.node.completed",
            ExecutionEvent::NodeFailed { .. } => "execution.node.failed",
            ExecutionEvent::NodeProgress { .. } => "execution.node.progress",
            ExecutionEvent::DataPassed { .. } => "data.flow.passed",
            ExecutionEvent::DataError { .. } => "data.flow.error",
        }
    }

    pub fn scope(&self) -> &EventScope {
        match self {
            ExecutionEvent::ExecutionStarted { scope, .. }
            | ExecutionEvent::ExecutionCompleted { scope, .. }
            | ExecutionEvent::ExecutionFailed { scope, .. }
            | ExecutionEvent::ExecutionCancelled { scope, .. }
            | ExecutionEvent::ExecutionTimedOut { scope, .. }
            | ExecutionEvent::ExecutionPaused { scope, .. }
            | ExecutionEvent::ExecutionResumed { scope, .. }
            | ExecutionEvent::NodeStarted { scope, .. }
            | ExecutionEvent::NodeCompleted { scope, .. }
            | ExecutionEvent::NodeFailed { scope, .. }
            | ExecutionEvent::NodeProgress { scope, .. }
            | ExecutionEvent::DataPassed { scope, .. }
            | ExecutionEvent::DataError { scope, .. } => scope,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.scope().execution_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExecutionEvent::ExecutionStarted { timestamp, .. }
            | ExecutionEvent::ExecutionCompleted { timestamp, .. }
            | ExecutionEvent::ExecutionFailed { timestamp, .. }
            | ExecutionEvent::ExecutionCancelled { timestamp, .. }
            | ExecutionEvent::ExecutionTimedOut { timestamp, .. }
            | ExecutionEvent::ExecutionPaused { timestamp, .. }
            | ExecutionEvent::ExecutionResumed { timestamp, .. }
            | ExecutionEvent::NodeStarted { timestamp, .. }
            | ExecutionEvent::NodeCompleted { timestamp, .. }
            | ExecutionEvent::NodeFailed { timestamp, .. }
            | ExecutionEvent::NodeProgress { timestamp, .. }
            | ExecutionEvent::DataPassed { timestamp, .. }
            | ExecutionEvent::DataError { timestamp, .. } => *timestamp,
        }
    }
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter for nodes to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    scope: EventScope,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(scope: EventScope, node_id: NodeId, sender: broadcast::Sender<ExecutionEvent>) -> Self {
        Self {
            scope,
            node_id,
            sender,
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeProgress {
            scope: self.scope.clone(),
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }
}

/// In-process channel between the orchestrator and its observers.
/// Publishing never blocks and never fails, even with no subscribers.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        tracing::trace!(kind = event.kind(), execution_id = %event.execution_id(), "emit");
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, scope: EventScope, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(scope, node_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
