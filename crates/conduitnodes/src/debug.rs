use async_trait::async_trait;
use conduitcore::{
    check_inputs, FieldSpec, FieldType, Node, NodeContext, NodeDefinition, NodeError, NodeOutput,
    Value,
};
use conduitruntime::NodeFactory;
use std::collections::HashMap;

pub const NODE_TYPE: &str = "debug.log";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NODE_TYPE, "1.0.0", "debug")
        .with_description("Logs input values for debugging")
        .with_input("message", FieldSpec::optional(FieldType::String))
        .with_input(
            "value",
            FieldSpec::optional(FieldType::Any).with_description("Passed through unchanged"),
        )
        .with_output("message", FieldSpec::required(FieldType::String))
        .with_output("value", FieldSpec::optional(FieldType::Any))
}

/// Simple debug node that logs its inputs
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_inputs(&definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .inputs
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)")
            .to_string();

        tracing::info!(node_id = %ctx.node_id, execution_id = %ctx.execution_id, "{}", message);
        ctx.events.info(format!("DEBUG: {}", message));

        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.events.info(format!("  {}: {:?}", key, ctx.inputs[key]));
        }

        let mut output = NodeOutput::new().with_output("message", message);
        if let Some(value) = ctx.inputs.get("value") {
            output = output
                .with_output("value", value.clone())
                .with_records(value.record_count());
        }
        Ok(output)
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }
}
