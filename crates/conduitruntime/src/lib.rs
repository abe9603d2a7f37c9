//! Flow execution runtime
//!
//! This crate provides the execution engine that runs flows: the node type
//! registry, schema compatibility checks, the DAG orchestrator with retry,
//! cancellation and pause, and the broadcaster that fans execution events
//! out to observers.

mod broadcaster;
mod compatibility;
mod executor;
mod orchestrator;
mod registry;
mod runtime;
mod store;

pub use broadcaster::{
    BroadcastMessage, EventBroadcaster, InvalidRoom, DEFAULT_OBSERVER_BUFFER, MessageKind, ObserverHandle, ObserverId,
    Room, Subscription, SubscriptionRegistry,
};
pub use compatibility::{
    check_schema_compatibility, CompatibilityIssue, CompatibilityLevel, CompatibilityMatrix,
    CompatibilityResult, CompatibilityValidator, ConnectionReport, FieldMapping, IssueKind,
    MatrixMetadata, Severity, SuggestionKind, Transformation, TransformationSuggestion,
};
pub use executor::{ExecutionControl, ExecutionGraph};
pub use orchestrator::{ExecutionHandle, ExecutionOrchestrator};
pub use registry::{NodeFactory, NodeRegistry, SchemaCatalog};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use store::{FlowStore, MemoryStore};
