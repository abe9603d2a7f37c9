use crate::{DefinitionError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub type FlowId = Uuid;

/// Author-assigned key of a node instance, unique within its flow
pub type NodeId = String;

/// A directed graph of node instances describing a processing pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeInstance>,
    #[serde(default)]
    pub connections: Vec<NodeConnection>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: FlowStatus,
}

fn default_version() -> u32 {
    1
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            version: default_version(),
            status: FlowStatus::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeInstance) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<NodeId>,
        from_output: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_input: impl Into<String>,
    ) {
        self.connections.push(NodeConnection {
            from_node_id: from_node.into(),
            from_output: from_output.into(),
            to_node_id: to_node.into(),
            to_input: to_input.into(),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeInstance> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Connections feeding the given node
    pub fn inbound<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a NodeConnection> + 'a {
        self.connections.iter().filter(move |c| c.to_node_id == id)
    }

    /// Check that node ids are unique and every connection stays inside this flow.
    /// Cycles are detected when the execution graph is built.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
        }

        for conn in &self.connections {
            for id in [&conn.from_node_id, &conn.to_node_id] {
                if !seen.contains(id.as_str()) {
                    return Err(DefinitionError::NodeNotFound(id.clone()));
                }
            }
            if conn.from_output.is_empty() || conn.to_input.is_empty() {
                return Err(DefinitionError::InvalidConnection(format!(
                    "{} -> {} must name both ports",
                    conn.from_node_id, conn.to_node_id
                )));
            }
        }

        let mut bound_inputs = HashSet::new();
        for conn in &self.connections {
            if !bound_inputs.insert((conn.to_node_id.as_str(), conn.to_input.as_str())) {
                return Err(DefinitionError::InvalidConnection(format!(
                    "input '{}' of node {} is bound more than once",
                    conn.to_input, conn.to_node_id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Inactive,
    Archived,
}

/// Node instance in a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl NodeInstance {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            version: None,
            name: None,
            config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Connection from one node's output port to another node's input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnection {
    pub from_node_id: NodeId,
    pub from_output: String,
    pub to_node_id: NodeId,
    pub to_input: String,
}
