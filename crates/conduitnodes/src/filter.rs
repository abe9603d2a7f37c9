use async_trait::async_trait;
use conduitcore::{
    check_inputs, FieldSpec, FieldType, Node, NodeContext, NodeDefinition, NodeError, NodeOutput,
    Value,
};
use conduitruntime::NodeFactory;
use std::collections::HashMap;

pub const NODE_TYPE: &str = "data.filter";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NODE_TYPE, "1.0.0", "data")
        .with_description("Keep the objects whose field equals a configured value")
        .with_input("items", FieldSpec::required(FieldType::Array))
        .with_output("items", FieldSpec::required(FieldType::Array))
        .with_output("count", FieldSpec::required(FieldType::Number))
}

/// Filters an array of objects on `config.field == config.equals`
pub struct FilterNode {
    field: String,
    equals: Value,
}

impl FilterNode {
    pub fn new(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    fn keep(&self, item: &Value) -> bool {
        match item {
            Value::Object(fields) => fields.get(&self.field) == Some(&self.equals),
            _ => false,
        }
    }
}

#[async_trait]
impl Node for FilterNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_inputs(&definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = ctx
            .require_input("items")?
            .as_array()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "items".to_string(),
                expected: "array".to_string(),
                actual: "other".to_string(),
            })?;

        let kept: Vec<Value> = items.iter().filter(|item| self.keep(item)).cloned().collect();
        ctx.events.info(format!(
            "Kept {} of {} items where {} matched",
            kept.len(),
            items.len(),
            self.field
        ));

        let count = kept.len() as f64;
        Ok(NodeOutput::new()
            .with_output("items", kept)
            .with_output("count", count)
            .with_records(items.len() as u64))
    }
}

pub struct FilterNodeFactory;

impl NodeFactory for FilterNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let field = config
            .get("field")
            .and_then(|v| v.as_str())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| NodeError::Configuration("'field' must be a non-empty string".to_string()))?;
        let equals = config
            .get("equals")
            .cloned()
            .ok_or_else(|| NodeError::Configuration("Missing config: equals".to_string()))?;
        Ok(Box::new(FilterNode::new(field, equals)))
    }
}
