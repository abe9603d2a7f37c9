use crate::{NodeError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Declared fields of a node's input or output, ordered by name so every
/// walk over a schema is deterministic.
pub type Schema = BTreeMap<String, FieldSpec>;

/// Primitive type a schema field accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
    Binary,
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Date => "date",
            FieldType::Binary => "binary",
            FieldType::Any => "any",
        }
    }

    /// Same type, or either side is `Any`.
    pub fn matches(self, other: FieldType) -> bool {
        self == other || self == FieldType::Any || other == FieldType::Any
    }

    /// Lossy conversions supported between producer and consumer:
    /// string <-> number and string <-> boolean.
    pub fn castable_to(self, other: FieldType) -> bool {
        matches!(
            (self, other),
            (FieldType::String, FieldType::Number)
                | (FieldType::Number, FieldType::String)
                | (FieldType::String, FieldType::Boolean)
                | (FieldType::Boolean, FieldType::String)
        )
    }

    /// Whether a runtime value satisfies this declared type.
    pub fn accepts(self, value: &Value) -> bool {
        self == FieldType::Any || value.field_type().matches(self)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check assembled inputs against a declared input schema: every required
/// field present and non-null, every present field of an accepted type.
pub fn check_inputs(schema: &Schema, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
    for (name, spec) in schema {
        match inputs.get(name) {
            None | Some(Value::Null) if spec.required => {
                return Err(NodeError::MissingInput(name.clone()));
            }
            Some(value) if !value.is_null() && !spec.field_type.accepts(value) => {
                return Err(NodeError::InvalidInputType {
                    field: name.clone(),
                    expected: spec.field_type.to_string(),
                    actual: value.field_type().to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// One field of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl FieldSpec {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Static descriptor of a node type, supplied once at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    #[serde(rename = "type")]
    pub node_type: String,
    pub version: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Schema,
    #[serde(default)]
    pub output_schema: Schema,
}

impl NodeDefinition {
    pub fn new(
        node_type: impl Into<String>,
        version: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            version: version.into(),
            category: category.into(),
            description: String::new(),
            input_schema: Schema::new(),
            output_schema: Schema::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.input_schema.insert(name.into(), spec);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.output_schema.insert(name.into(), spec);
        self
    }

    /// The lookup-facing subset of the descriptor.
    pub fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            node_type: self.node_type.clone(),
            version: self.version.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
        }
    }
}

/// Metadata about a registered node type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(rename = "type")]
    pub node_type: String,
    pub version: String,
    pub category: String,
    pub description: String,
}
