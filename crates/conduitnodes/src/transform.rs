use async_trait::async_trait;
use conduitcore::{
    check_inputs, FieldSpec, FieldType, Node, NodeContext, NodeDefinition, NodeError, NodeOutput,
    Value,
};
use conduitruntime::NodeFactory;
use std::collections::HashMap;

pub const JSON_PARSE: &str = "transform.json_parse";
pub const JSON_STRINGIFY: &str = "transform.json_stringify";

pub fn json_parse_definition() -> NodeDefinition {
    NodeDefinition::new(JSON_PARSE, "1.0.0", "transform")
        .with_description("Parse JSON string")
        .with_input("json", FieldSpec::required(FieldType::String))
        .with_output(
            "parsed",
            FieldSpec::required(FieldType::Any).with_description("Arrays and objects become structured values"),
        )
}

pub fn json_stringify_definition() -> NodeDefinition {
    NodeDefinition::new(JSON_STRINGIFY, "1.0.0", "transform")
        .with_description("Convert value to JSON string")
        .with_input("value", FieldSpec::required(FieldType::Any))
        .with_output("json", FieldSpec::required(FieldType::String))
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        JSON_PARSE
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_inputs(&json_parse_definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx
            .require_input("json")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "json".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
        let parsed = Value::from_plain_json(parsed);
        let records = parsed.record_count();

        Ok(NodeOutput::new()
            .with_output("parsed", parsed)
            .with_records(records))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode {
    pretty: bool,
}

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        JSON_STRINGIFY
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_inputs(&json_stringify_definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?.to_plain_json();

        let json_str = if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", json_str).with_records(1))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let pretty = match config.get("pretty") {
            None => false,
            Some(value) => value.as_bool().ok_or_else(|| {
                NodeError::Configuration("'pretty' must be a boolean".to_string())
            })?,
        };
        Ok(Box::new(JsonStringifyNode { pretty }))
    }
}
