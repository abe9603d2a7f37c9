use async_trait::async_trait;
use conduitcore::{
    check_inputs, FieldSpec, FieldType, Node, NodeContext, NodeDefinition, NodeError, NodeOutput,
    Value,
};
use conduitruntime::NodeFactory;
use std::collections::HashMap;
use std::time::Duration;

pub const NODE_TYPE: &str = "http.request";

pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NODE_TYPE, "1.0.0", "http")
        .with_description("Make HTTP requests")
        .with_input("url", FieldSpec::required(FieldType::String))
        .with_input(
            "body",
            FieldSpec::optional(FieldType::Any).with_description("Sent for POST, PUT and PATCH"),
        )
        .with_output("status", FieldSpec::required(FieldType::Number))
        .with_output("body", FieldSpec::required(FieldType::String))
        .with_output("headers", FieldSpec::required(FieldType::Object))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
    method: Method,
    headers: Vec<(String, String)>,
    fail_on_status: bool,
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_inputs(&definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = ctx
            .require_input("url")?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: "url".to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })?;

        ctx.events.info(format!("{:?} {}", self.method, url));

        let mut request = match self.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Put => self.client.put(url),
            Method::Patch => self.client.patch(url),
            Method::Delete => self.client.delete(url),
        };

        if self.method.has_body() {
            match ctx.inputs.get("body") {
                Some(Value::String(text)) => request = request.body(text.clone()),
                Some(Value::Null) | None => {}
                Some(other) => request = request.json(&other.to_plain_json()),
            }
        }

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if self.fail_on_status && (status.is_client_error() || status.is_server_error()) {
            return Err(NodeError::ExecutionFailed(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        Ok(NodeOutput::new()
            .with_output("status", status.as_u16() as f64)
            .with_output("body", body_text)
            .with_output("headers", Value::Object(headers_map))
            .with_records(1))
    }
}

/// Reads `method`, `headers`, `timeout_ms` and `fail_on_status` from the
/// instance configuration.
pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let method = match config.get("method") {
            None => Method::Get,
            Some(value) => value
                .as_str()
                .and_then(Method::parse)
                .ok_or_else(|| NodeError::Configuration(format!("Unsupported method: {:?}", value)))?,
        };

        let headers = match config.get("headers") {
            None => Vec::new(),
            Some(Value::Object(headers)) => headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
            Some(_) => {
                return Err(NodeError::Configuration(
                    "'headers' must be an object of strings".to_string(),
                ))
            }
        };

        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.get("timeout_ms").and_then(|v| v.as_f64()) {
            builder = builder.timeout(Duration::from_millis(ms.max(0.0) as u64));
        }
        let client = builder
            .build()
            .map_err(|e| NodeError::Configuration(format!("HTTP client: {}", e)))?;

        let fail_on_status = config
            .get("fail_on_status")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Ok(Box::new(HttpRequestNode {
            client,
            method,
            headers,
            fail_on_status,
        }))
    }
}
