use crate::{events::EventEmitter, ExecutionId, FlowId, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Check assembled inputs before an attempt. A rejection fails the
    /// attempt and is retried like an execution failure.
    fn validate(&self, _inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node attempt
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub flow_id: FlowId,
    pub node_id: NodeId,

    /// 1-based attempt number for this node within the execution
    pub attempt: u32,

    /// Input values routed from upstream connections
    pub inputs: HashMap<String, Value>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Signalled when the execution is cancelled
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    /// Records handled by this node, summed into the execution total
    pub records_processed: u64,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_records(mut self, records: u64) -> Self {
        self.records_processed = records;
        self
    }
}
