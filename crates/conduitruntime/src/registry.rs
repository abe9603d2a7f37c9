use conduitcore::{FlowError, Node, NodeDefinition, NodeError, NodeMetadata, Schema, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory for creating node instances from instance configuration
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;
}

impl<F> NodeFactory for F
where
    F: Fn(&HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> + Send + Sync,
{
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        self(config)
    }
}

struct RegisteredNode {
    definition: NodeDefinition,
    factory: Arc<dyn NodeFactory>,
}

/// Catalog of available node types.
///
/// Each entry pairs a factory with the static descriptor supplied at
/// registration. Lookups read the descriptor only and never construct a node.
/// The registry is populated at startup and shared read-only afterwards.
pub struct NodeRegistry {
    nodes: HashMap<String, RegisteredNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a node type. Registering an existing type replaces it.
    pub fn register<F>(&mut self, definition: NodeDefinition, factory: F)
    where
        F: NodeFactory + 'static,
    {
        let node_type = definition.node_type.clone();
        let entry = RegisteredNode {
            definition,
            factory: Arc::new(factory),
        };
        match self.nodes.insert(node_type.clone(), entry) {
            Some(previous) => tracing::warn!(
                node_type = %node_type,
                previous_version = %previous.definition.version,
                "Node type re-registered, previous registration overwritten"
            ),
            None => tracing::info!(node_type = %node_type, "Registering node type"),
        }
    }

    /// Register a node type backed by a constructor closure
    pub fn register_fn<F>(&mut self, definition: NodeDefinition, constructor: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        self.register(definition, constructor);
    }

    /// Create a node instance from a node type and config
    pub fn create(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, FlowError> {
        let entry = self
            .nodes
            .get(node_type)
            .ok_or_else(|| FlowError::NodeTypeNotFound(node_type.to_string()))?;

        Ok(entry.factory.create(config)?)
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.nodes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.nodes.get(node_type).map(|n| n.definition.metadata())
    }

    /// Full descriptor including schemas
    pub fn definition(&self, node_type: &str) -> Option<&NodeDefinition> {
        self.nodes.get(node_type).map(|n| &n.definition)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of declared schemas, consulted by the compatibility validator
pub trait SchemaCatalog: Send + Sync {
    fn input_schema(&self, node_type: &str) -> Option<&Schema>;
    fn output_schema(&self, node_type: &str) -> Option<&Schema>;
}

impl SchemaCatalog for NodeRegistry {
    fn input_schema(&self, node_type: &str) -> Option<&Schema> {
        self.definition(node_type).map(|d| &d.input_schema)
    }

    fn output_schema(&self, node_type: &str) -> Option<&Schema> {
        self.definition(node_type).map(|d| &d.output_schema)
    }
}
