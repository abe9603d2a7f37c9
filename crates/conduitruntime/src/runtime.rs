use crate::broadcaster::{EventBroadcaster, ObserverHandle, Room, DEFAULT_OBSERVER_BUFFER};
use crate::compatibility::{CompatibilityValidator, ConnectionReport};
use crate::orchestrator::{ExecutionHandle, ExecutionOrchestrator};
use crate::registry::NodeRegistry;
use crate::store::{FlowStore, MemoryStore};
use conduitcore::{
    EventBus, Execution, ExecutionEvent, ExecutionId, Flow, FlowError, RetryPolicy, Trigger,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main entry point wiring the registry, orchestrator, validator and
/// broadcaster around one event bus and one store.
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn FlowStore>,
    event_bus: Arc<EventBus>,
    orchestrator: ExecutionOrchestrator,
    validator: CompatibilityValidator,
    broadcaster: Arc<EventBroadcaster>,
}

impl FlowRuntime {
    /// Create a runtime over a populated registry with an in-memory store
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: NodeRegistry, config: RuntimeConfig) -> Self {
        Self::with_store(registry, Arc::new(MemoryStore::new()), config)
    }

    /// Create a runtime over a caller-supplied store.
    ///
    /// The broadcaster starts pumping immediately, so this must be called
    /// from within a tokio runtime.
    pub fn with_store(
        registry: NodeRegistry,
        store: Arc<dyn FlowStore>,
        config: RuntimeConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let orchestrator =
            ExecutionOrchestrator::new(registry.clone(), event_bus.clone(), store.clone(), &config);
        let validator = CompatibilityValidator::new(registry.clone());
        let broadcaster = Arc::new(EventBroadcaster::with_observer_buffer(
            config.observer_buffer_size,
        ));
        broadcaster.start(&event_bus);

        tracing::info!(
            node_types = registry.len(),
            max_parallel_nodes = config.max_parallel_nodes,
            "Flow runtime ready"
        );

        Self {
            registry,
            store,
            event_bus,
            orchestrator,
            validator,
            broadcaster,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &ExecutionOrchestrator {
        &self.orchestrator
    }

    pub fn validator(&self) -> &CompatibilityValidator {
        &self.validator
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Persist a flow so it can later be retried by execution id
    pub async fn register_flow(&self, flow: &Flow) -> Result<(), FlowError> {
        self.store.save_flow(flow).await
    }

    /// Start executing a flow. The orchestrator persists the flow and any
    /// schedule so the execution can be retried later.
    pub async fn execute(&self, flow: &Flow, trigger: Trigger) -> Result<ExecutionHandle, FlowError> {
        self.orchestrator.start_execution(flow, trigger).await
    }

    /// Execute and wait for the terminal record
    pub async fn run(&self, flow: &Flow, trigger: Trigger) -> Result<Execution, FlowError> {
        self.execute(flow, trigger).await?.wait().await
    }

    pub async fn cancel(&self, id: ExecutionId) -> Result<(), FlowError> {
        self.orchestrator.cancel_execution(id).await
    }

    pub async fn pause(&self, id: ExecutionId) -> Result<(), FlowError> {
        self.orchestrator.pause_execution(id).await
    }

    pub async fn resume(&self, id: ExecutionId) -> Result<(), FlowError> {
        self.orchestrator.resume_execution(id).await
    }

    pub async fn retry(&self, id: ExecutionId) -> Result<ExecutionHandle, FlowError> {
        self.orchestrator.retry_execution(id).await
    }

    /// Check every connection of a flow against declared schemas
    pub fn check_flow(&self, flow: &Flow) -> Result<Vec<ConnectionReport>, FlowError> {
        self.validator.check_flow(flow)
    }

    /// Connect an observer already joined to the given rooms
    pub fn observe(&self, user_id: Option<String>, rooms: impl IntoIterator<Item = Room>) -> ObserverHandle {
        let handle = self.broadcaster.connect(user_id);
        for room in rooms {
            self.broadcaster.subscribe(handle.id, room);
        }
        handle
    }

    /// Raw domain events, before broadcaster mapping
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn shutdown(&self) {
        self.broadcaster.shutdown().await;
        tracing::info!("Flow runtime shut down");
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Undelivered messages an observer may hold before it is disconnected
    pub observer_buffer_size: usize,
    /// Used when a trigger carries no schedule
    pub default_retry: RetryPolicy,
    /// Per-attempt limit on a node's execute call
    pub node_timeout_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            observer_buffer_size: DEFAULT_OBSERVER_BUFFER,
            default_retry: RetryPolicy::default(),
            node_timeout_ms: None,
        }
    }
}
