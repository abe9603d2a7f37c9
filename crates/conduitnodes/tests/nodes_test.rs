use conduitcore::{EventBus, EventScope, Flow, Node, NodeContext, NodeError, NodeInstance, Trigger, Value};
use conduitnodes::{
    standard_registry, DebugNode, DelayNode, FilterNode, FilterNodeFactory, HttpRequestNodeFactory,
    JsonParseNode, JsonStringifyNodeFactory, DelayNodeFactory,
};
use conduitruntime::{FlowRuntime, NodeFactory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Helper function to create a test context
fn create_test_context(inputs: HashMap<String, Value>) -> NodeContext {
    let event_bus = Arc::new(EventBus::new(100));
    let execution_id = uuid::Uuid::new_v4();

    NodeContext {
        execution_id,
        flow_id: uuid::Uuid::new_v4(),
        node_id: "under_test".to_string(),
        attempt: 1,
        inputs,
        config: HashMap::new(),
        events: event_bus.create_emitter(EventScope::new(execution_id), "under_test".to_string()),
        cancellation: CancellationToken::new(),
    }
}

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn object(pairs: &[(&str, Value)]) -> Value {
    Value::Object(inputs(pairs))
}

#[tokio::test]
async fn test_debug_passes_value_through() {
    let node = DebugNode;
    let items = Value::from(vec![Value::from(1.0), Value::from(2.0)]);

    let output = node
        .execute(create_test_context(inputs(&[
            ("message", Value::from("hello")),
            ("value", items.clone()),
        ])))
        .await
        .unwrap();

    assert_eq!(output.outputs["message"], Value::from("hello"));
    assert_eq!(output.outputs["value"], items);
    assert_eq!(output.records_processed, 2);
}

#[test]
fn test_debug_rejects_non_string_message() {
    let err = DebugNode
        .validate(&inputs(&[("message", Value::from(1.0))]))
        .unwrap_err();

    assert!(matches!(err, NodeError::InvalidInputType { field, .. } if field == "message"));
}

#[tokio::test]
async fn test_json_parse() {
    let node = JsonParseNode;

    let output = node
        .execute(create_test_context(inputs(&[(
            "json",
            Value::from(r#"[{"id": 1}, {"id": 2}]"#),
        )])))
        .await
        .unwrap();

    let parsed = output.outputs["parsed"].as_array().unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(output.records_processed, 2);
}

#[tokio::test]
async fn test_json_parse_invalid() {
    let err = JsonParseNode
        .execute(create_test_context(inputs(&[("json", Value::from("{nope"))])))
        .await
        .unwrap_err();

    assert!(matches!(err, NodeError::ExecutionFailed(m) if m.starts_with("JSON parse error")));
}

#[test]
fn test_json_parse_requires_input() {
    assert_eq!(
        JsonParseNode.validate(&HashMap::new()),
        Err(NodeError::MissingInput("json".to_string()))
    );
}

#[tokio::test]
async fn test_json_stringify() {
    let node = JsonStringifyNodeFactory.create(&HashMap::new()).unwrap();
    let value = object(&[("name", Value::from("ada"))]);

    let output = node
        .execute(create_test_context(inputs(&[("value", value)])))
        .await
        .unwrap();

    assert_eq!(output.outputs["json"], Value::from(r#"{"name":"ada"}"#));
}

#[test]
fn test_json_stringify_rejects_bad_pretty() {
    let config = inputs(&[("pretty", Value::from("yes"))]);

    let err = JsonStringifyNodeFactory.create(&config).err().unwrap();

    assert!(matches!(err, NodeError::Configuration(_)));
}

#[tokio::test]
async fn test_delay_passes_inputs() {
    let node = DelayNode::new(Duration::from_millis(5));

    let output = node
        .execute(create_test_context(inputs(&[("value", Value::from(3.0))])))
        .await
        .unwrap();

    assert_eq!(output.outputs["value"], Value::from(3.0));
}

#[tokio::test]
async fn test_delay_observes_cancellation() {
    let node = DelayNode::new(Duration::from_secs(30));
    let ctx = create_test_context(HashMap::new());
    let token = ctx.cancellation.clone();

    let task = tokio::spawn(async move { node.execute(ctx).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.err(), Some(NodeError::Cancelled));
}

#[test]
fn test_delay_config_validation() {
    assert!(DelayNodeFactory.create(&HashMap::new()).is_ok());
    assert!(DelayNodeFactory
        .create(&inputs(&[("delay_ms", Value::from(-5.0))]))
        .is_err());
    assert!(DelayNodeFactory
        .create(&inputs(&[("delay_ms", Value::from("soon"))]))
        .is_err());
}

#[tokio::test]
async fn test_filter_keeps_matching_objects() {
    let node = FilterNode::new("status", "active");
    let items = Value::from(vec![
        object(&[("status", Value::from("active")), ("id", Value::from(1.0))]),
        object(&[("status", Value::from("archived")), ("id", Value::from(2.0))]),
        object(&[("status", Value::from("active")), ("id", Value::from(3.0))]),
        Value::from("not an object"),
    ]);

    let output = node
        .execute(create_test_context(inputs(&[("items", items)])))
        .await
        .unwrap();

    assert_eq!(output.outputs["items"].record_count(), 2);
    assert_eq!(output.outputs["count"], Value::from(2.0));
    assert_eq!(output.records_processed, 4);
}

#[test]
fn test_filter_config_validation() {
    let missing_field = inputs(&[("equals", Value::from(1.0))]);
    let empty_field = inputs(&[("field", Value::from("")), ("equals", Value::from(1.0))]);
    let missing_equals = inputs(&[("field", Value::from("id"))]);

    for config in [missing_field, empty_field, missing_equals] {
        let err = FilterNodeFactory.create(&config).err().unwrap();
        assert!(matches!(err, NodeError::Configuration(_)));
    }
}

#[test]
fn test_http_config_validation() {
    let bad_method = inputs(&[("method", Value::from("TRACE"))]);
    let bad_headers = inputs(&[("headers", Value::from("x-api-key: 1"))]);

    assert!(HttpRequestNodeFactory.create(&HashMap::new()).is_ok());
    assert!(HttpRequestNodeFactory
        .create(&inputs(&[("method", Value::from("post"))]))
        .is_ok());
    assert!(matches!(
        HttpRequestNodeFactory.create(&bad_method).err(),
        Some(NodeError::Configuration(_))
    ));
    assert!(matches!(
        HttpRequestNodeFactory.create(&bad_headers).err(),
        Some(NodeError::Configuration(_))
    ));
}

#[test]
fn test_standard_registry_types() {
    let registry = standard_registry();

    assert_eq!(
        registry.list_types(),
        vec![
            "data.filter",
            "debug.log",
            "http.request",
            "time.delay",
            "transform.json_parse",
            "transform.json_stringify",
        ]
    );
    let meta = registry.get_metadata("http.request").unwrap();
    assert_eq!(meta.category, "http");
}

#[tokio::test]
async fn test_parse_filter_debug_pipeline() {
    let runtime = FlowRuntime::new(standard_registry());
    let mut flow = Flow::new("pipeline");
    flow.add_node(NodeInstance::new("parse", "transform.json_parse"));
    flow.add_node(
        NodeInstance::new("filter", "data.filter")
            .with_config("field", "kind")
            .with_config("equals", "a"),
    );
    flow.add_node(NodeInstance::new("log", "debug.log"));
    flow.connect("parse", "parsed", "filter", "items");
    flow.connect("filter", "items", "log", "value");

    let trigger = Trigger::manual().with_input(
        "json",
        r#"[{"kind": "a"}, {"kind": "b"}, {"kind": "a"}]"#,
    );
    let execution = runtime.run(&flow, trigger).await.unwrap();

    assert_eq!(execution.status, conduitcore::ExecutionStatus::Success);
    // 3 parsed + 3 filtered + 2 logged
    assert_eq!(execution.records_processed, 8);

    let reports = runtime.check_flow(&flow).unwrap();
    assert!(reports.iter().all(|r| !r.has_errors()));
    runtime.shutdown().await;
}
