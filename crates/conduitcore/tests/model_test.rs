use conduitcore::{
    check_inputs, DefinitionError, Execution, ExecutionEvent, ExecutionStatus, FieldSpec,
    FieldType, Flow, FlowError, NodeError, NodeExecution, NodeExecutionStatus, NodeInstance,
    RetryPolicy, Schedule, Schema, Trigger, TriggerKind, Value,
};
use std::collections::HashMap;

fn two_node_flow() -> Flow {
    let mut flow = Flow::new("pair");
    flow.add_node(NodeInstance::new("a", "test.echo"));
    flow.add_node(NodeInstance::new("b", "test.echo"));
    flow.connect("a", "value", "b", "value");
    flow
}

#[test]
fn test_execution_lifecycle() {
    let flow = two_node_flow();
    let mut execution = Execution::new(flow.id, &Trigger::manual().with_user("ada"));

    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.user_id.as_deref(), Some("ada"));
    assert!(execution.end_time.is_none());

    execution.transition(ExecutionStatus::Running).unwrap();
    execution.transition(ExecutionStatus::Paused).unwrap();
    execution.transition(ExecutionStatus::Running).unwrap();
    execution.transition(ExecutionStatus::Success).unwrap();

    assert!(execution.is_terminal());
    assert!(execution.end_time.is_some());
    assert!(execution.duration_ms.is_some());
}

#[test]
fn test_terminal_status_is_final() {
    let mut execution = Execution::new(uuid::Uuid::new_v4(), &Trigger::manual());
    execution.transition(ExecutionStatus::Running).unwrap();
    execution.transition(ExecutionStatus::Failed).unwrap();

    for next in [
        ExecutionStatus::Running,
        ExecutionStatus::Paused,
        ExecutionStatus::Success,
        ExecutionStatus::Cancelled,
    ] {
        let err = execution.transition(next).unwrap_err();
        assert!(matches!(err, FlowError::InvalidTransition { .. }));
    }
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[test]
fn test_pending_cannot_skip_running() {
    let mut execution = Execution::new(uuid::Uuid::new_v4(), &Trigger::manual());

    assert!(execution.transition(ExecutionStatus::Success).is_err());
    assert!(execution.transition(ExecutionStatus::Paused).is_err());
    assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Cancelled));
    assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Timeout));
}

#[test]
fn test_node_execution_record() {
    let mut record = NodeExecution::start(uuid::Uuid::new_v4(), "a".into(), "test.echo".into());
    assert_eq!(record.status, NodeExecutionStatus::Running);

    record.fail(3, "boom");

    assert_eq!(record.status, NodeExecutionStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.error_message.as_deref(), Some("boom"));
    assert!(record.end_time.is_some());
}

#[test]
fn test_trigger_inputs_are_kept_on_execution() {
    let trigger = Trigger::manual().with_input("url", "https://example.com");

    let execution = Execution::new(uuid::Uuid::new_v4(), &trigger);

    assert_eq!(execution.trigger, TriggerKind::Manual);
    assert_eq!(
        execution.inputs.get("url"),
        Some(&Value::from("https://example.com"))
    );
}

#[test]
fn test_schedule_policy_overrides_default() {
    let flow_id = uuid::Uuid::new_v4();
    let fallback = RetryPolicy::new(1, 500);
    let schedule = Schedule::new(flow_id).with_retry(3, 50).with_timeout(2_000).with_owner("ops");
    let trigger = Trigger::scheduled(schedule.clone());

    assert_eq!(trigger.kind, TriggerKind::Schedule);
    assert_eq!(trigger.user_id.as_deref(), Some("ops"));
    assert_eq!(trigger.schedule_id(), Some(schedule.id));
    assert_eq!(trigger.retry_policy(fallback), RetryPolicy::new(3, 50));
    assert_eq!(trigger.retry_policy(fallback).max_attempts(), 4);
    assert_eq!(trigger.timeout().map(|d| d.as_millis()), Some(2_000));
    assert_eq!(Trigger::manual().retry_policy(fallback), fallback);
}

#[test]
fn test_flow_validate() {
    assert!(two_node_flow().validate().is_ok());

    let mut duplicate = two_node_flow();
    duplicate.add_node(NodeInstance::new("a", "test.echo"));
    assert_eq!(
        duplicate.validate(),
        Err(DefinitionError::DuplicateNode("a".into()))
    );

    let mut dangling = two_node_flow();
    dangling.connect("a", "value", "ghost", "value");
    assert_eq!(
        dangling.validate(),
        Err(DefinitionError::NodeNotFound("ghost".into()))
    );

    let mut double_bound = two_node_flow();
    double_bound.add_node(NodeInstance::new("c", "test.echo"));
    double_bound.connect("c", "value", "b", "value");
    assert!(matches!(
        double_bound.validate(),
        Err(DefinitionError::InvalidConnection(_))
    ));
}

#[test]
fn test_flow_json_defaults() {
    let json = r#"{
        "id": "6f1c1f3e-8f3b-4d5e-9a43-2f0d9d1c7a10",
        "name": "from file",
        "nodes": [{ "id": "a", "type": "debug.log" }]
    }"#;

    let flow: Flow = serde_json::from_str(json).unwrap();

    assert_eq!(flow.version, 1);
    assert!(flow.connections.is_empty());
    assert_eq!(flow.nodes[0].node_type, "debug.log");
}

#[test]
fn test_plain_json_conversion() {
    let json = serde_json::json!({
        "name": "ada",
        "age": 36.5,
        "tags": ["a", "b"],
        "active": true,
        "manager": null
    });

    let value = Value::from_plain_json(json.clone());

    let fields = value.as_object().unwrap();
    assert_eq!(fields["name"], Value::from("ada"));
    assert_eq!(fields["age"], Value::Number(36.5));
    assert_eq!(fields["tags"].record_count(), 2);
    assert!(fields["manager"].is_null());
    assert_eq!(value.to_plain_json(), json);
}

#[test]
fn test_value_types_and_records() {
    assert_eq!(Value::Null.record_count(), 0);
    assert_eq!(Value::from("x").record_count(), 1);
    assert_eq!(Value::from(serde_json::json!([1, 2, 3])).record_count(), 3);
    assert_eq!(Value::Bytes(vec![1]).field_type(), FieldType::Binary);
    assert_eq!(Value::from(true).field_type(), FieldType::Boolean);
}

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert("count".into(), FieldSpec::required(FieldType::Number));
    schema.insert("label".into(), FieldSpec::optional(FieldType::String));
    schema.insert("payload".into(), FieldSpec::optional(FieldType::Any));
    schema
}

#[test]
fn test_check_inputs() {
    let schema = schema();
    let mut inputs: HashMap<String, Value> = HashMap::new();

    assert_eq!(
        check_inputs(&schema, &inputs),
        Err(NodeError::MissingInput("count".into()))
    );

    inputs.insert("count".into(), Value::Null);
    assert_eq!(
        check_inputs(&schema, &inputs),
        Err(NodeError::MissingInput("count".into()))
    );

    inputs.insert("count".into(), Value::from("3"));
    assert_eq!(
        check_inputs(&schema, &inputs),
        Err(NodeError::InvalidInputType {
            field: "count".into(),
            expected: "number".into(),
            actual: "string".into(),
        })
    );

    inputs.insert("count".into(), Value::from(3.0));
    inputs.insert("label".into(), Value::Null);
    inputs.insert("payload".into(), Value::from(vec![Value::from(1.0)]));
    assert_eq!(check_inputs(&schema, &inputs), Ok(()));
}

#[test]
fn test_event_kind_names() {
    let scope = conduitcore::EventScope::new(uuid::Uuid::new_v4());
    let event = ExecutionEvent::ExecutionTimedOut {
        scope: scope.clone(),
        timeout_ms: 10,
        timestamp: chrono::Utc::now(),
    };

    assert_eq!(event.kind(), "execution.timeout");
    assert_eq!(event.execution_id(), scope.execution_id);

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "execution_timed_out");
    assert_eq!(json["executionId"], scope.execution_id.to_string());
}
