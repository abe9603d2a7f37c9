//! Core abstractions for the conduit flow engine
//!
//! This crate provides the data model every other component depends on:
//! values and schemas, the node capability trait, flows, triggers,
//! execution records and the typed domain events. It holds no scheduling
//! logic.

mod error;
pub mod events;
mod execution;
mod flow;
mod node;
mod schema;
mod trigger;
mod value;

pub use error::{DefinitionError, FlowError, NodeError};
pub use events::*;
pub use execution::{
    Execution, ExecutionId, ExecutionStatus, NodeExecution, NodeExecutionStatus,
};
pub use flow::{Flow, FlowId, FlowStatus, NodeConnection, NodeId, NodeInstance};
pub use node::{Node, NodeContext, NodeOutput};
pub use schema::{check_inputs, FieldSpec, FieldType, NodeDefinition, NodeMetadata, Schema};
pub use trigger::{RetryPolicy, Schedule, ScheduleId, Trigger, TriggerKind};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
