mod common;

use chrono::Utc;
use conduitcore::{
    EventBus, EventScope, ExecutionEvent, Flow, NodeConnection, NodeEvent, NodeInstance, Trigger,
    TriggerKind,
};
use conduitruntime::{BroadcastMessage, EventBroadcaster, MessageKind, ObserverHandle, Room};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn scope() -> EventScope {
    EventScope::new(Uuid::new_v4())
        .with_flow(Uuid::new_v4())
        .with_user(Some("ada".to_string()))
}

fn started(scope: &EventScope) -> ExecutionEvent {
    ExecutionEvent::ExecutionStarted {
        scope: scope.clone(),
        trigger: TriggerKind::Manual,
        timestamp: Utc::now(),
    }
}

fn drain(handle: &mut ObserverHandle) -> Vec<BroadcastMessage> {
    let mut messages = Vec::new();
    while let Some(message) = handle.try_recv() {
        messages.push(message);
    }
    messages
}

#[test]
fn test_execution_room_receives_update() {
    let broadcaster = EventBroadcaster::new();
    let mut observer = broadcaster.connect(None);
    let scope = scope();
    broadcaster.subscribe(observer.id, Room::Execution(scope.execution_id));

    let delivered = broadcaster.publish(&started(&scope));

    assert_eq!(delivered, 1);
    let messages = drain(&mut observer);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, MessageKind::ExecutionUpdate);
    assert_eq!(messages[0].status.as_deref(), Some("running"));
    assert_eq!(messages[0].execution_id, scope.execution_id);
    assert_eq!(messages[0].flow_id, scope.flow_id);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let broadcaster = EventBroadcaster::new();
    let mut observer = broadcaster.connect(None);
    let scope = scope();
    let room = Room::Execution(scope.execution_id);
    broadcaster.subscribe(observer.id, room.clone());

    assert!(broadcaster.unsubscribe(observer.id, &room));
    let delivered = broadcaster.publish(&started(&scope));

    assert_eq!(delivered, 0);
    assert!(drain(&mut observer).is_empty());
    assert!(!broadcaster.unsubscribe(observer.id, &room));
}

#[test]
fn test_one_delivery_per_observer_across_rooms() {
    let broadcaster = EventBroadcaster::new();
    let mut observer = broadcaster.connect(Some("ada".to_string()));
    let scope = scope();
    broadcaster.subscribe(observer.id, Room::Execution(scope.execution_id));
    broadcaster.subscribe(observer.id, Room::Flow(scope.flow_id.unwrap()));

    broadcaster.publish(&started(&scope));

    assert_eq!(drain(&mut observer).len(), 1);
}

#[test]
fn test_user_room_joined_on_connect() {
    let broadcaster = EventBroadcaster::new();
    let mut ada = broadcaster.connect(Some("ada".to_string()));
    let mut bob = broadcaster.connect(Some("bob".to_string()));
    let mut anonymous = broadcaster.connect(None);

    broadcaster.publish(&started(&scope()));

    assert_eq!(drain(&mut ada).len(), 1);
    assert!(drain(&mut bob).is_empty());
    assert!(drain(&mut anonymous).is_empty());

    let subscription = broadcaster.subscriptions().subscription(ada.id).unwrap();
    assert_eq!(subscription.user_id.as_deref(), Some("ada"));
    assert!(subscription.rooms.contains(&Room::User("ada".to_string())));
}

#[test]
fn test_room_membership_counts() {
    let broadcaster = EventBroadcaster::new();
    let flow = Room::Flow(Uuid::new_v4());
    let first = broadcaster.connect(None);
    let second = broadcaster.connect(None);

    assert!(broadcaster.subscribe(first.id, flow.clone()));
    assert!(!broadcaster.subscribe(first.id, flow.clone()));
    assert!(broadcaster.subscribe(second.id, flow.clone()));
    assert_eq!(broadcaster.room_members(&flow), 2);

    assert!(broadcaster.disconnect(first.id));
    assert_eq!(broadcaster.room_members(&flow), 1);
    assert!(!broadcaster.subscribe(first.id, flow));
}

#[test]
fn test_dropped_observer_is_pruned() {
    let broadcaster = EventBroadcaster::new();
    let scope = scope();
    let room = Room::Execution(scope.execution_id);
    let gone = broadcaster.connect(None);
    let mut kept = broadcaster.connect(None);
    broadcaster.subscribe(gone.id, room.clone());
    broadcaster.subscribe(kept.id, room.clone());
    let gone_id = gone.id;
    drop(gone);

    let delivered = broadcaster.publish(&started(&scope));

    assert_eq!(delivered, 1);
    assert_eq!(drain(&mut kept).len(), 1);
    assert!(broadcaster.subscriptions().subscription(gone_id).is_none());
    assert_eq!(broadcaster.room_members(&room), 1);
}

#[tokio::test]
async fn test_full_observer_queue_disconnects_observer() {
    let broadcaster = EventBroadcaster::with_observer_buffer(2);
    let scope = scope();
    let room = Room::Execution(scope.execution_id);
    let mut stalled = broadcaster.connect(None);
    let mut draining = broadcaster.connect(None);
    broadcaster.subscribe(stalled.id, room.clone());
    broadcaster.subscribe(draining.id, room.clone());

    let mut kept = 0;
    for _ in 0..3 {
        broadcaster.publish(&started(&scope));
        kept += drain(&mut draining).len();
    }

    assert_eq!(kept, 3);
    assert!(broadcaster.subscriptions().subscription(stalled.id).is_none());
    assert_eq!(broadcaster.room_members(&room), 1);
    assert_eq!(drain(&mut stalled).len(), 2);
    assert!(stalled.recv().await.is_none());
}

#[test]
fn test_room_names_round_trip() {
    let id = Uuid::new_v4();

    assert_eq!(Room::Execution(id).to_string(), format!("execution:{}", id));
    assert_eq!(
        format!("flow:{}", id).parse::<Room>().unwrap(),
        Room::Flow(id)
    );
    assert_eq!("user:ada".parse::<Room>().unwrap(), Room::User("ada".to_string()));
    assert!("user:".parse::<Room>().is_err());
    assert!("execution:not-a-uuid".parse::<Room>().is_err());
    assert!("lobby".parse::<Room>().is_err());
}

#[test]
fn test_node_failure_status_reflects_retry() {
    let scope = scope();
    let failed = |will_retry| ExecutionEvent::NodeFailed {
        scope: scope.clone(),
        node_id: "fetch".to_string(),
        error: "connection reset".to_string(),
        attempt: 1,
        will_retry,
        timestamp: Utc::now(),
    };

    let retrying = BroadcastMessage::from(&failed(true));
    let terminal = BroadcastMessage::from(&failed(false));

    assert_eq!(retrying.kind, MessageKind::NodeUpdate);
    assert_eq!(retrying.node_id.as_deref(), Some("fetch"));
    assert_eq!(retrying.status.as_deref(), Some("retrying"));
    assert_eq!(terminal.status.as_deref(), Some("failed"));
    assert_eq!(terminal.error.as_deref(), Some("connection reset"));
}

#[test]
fn test_message_mapping() {
    let scope = scope();
    let connection = NodeConnection {
        from_node_id: "a".to_string(),
        from_output: "out".to_string(),
        to_node_id: "b".to_string(),
        to_input: "in".to_string(),
    };

    let timed_out = BroadcastMessage::from(&ExecutionEvent::ExecutionTimedOut {
        scope: scope.clone(),
        timeout_ms: 500,
        timestamp: Utc::now(),
    });
    assert_eq!(timed_out.status.as_deref(), Some("timeout"));
    assert_eq!(
        timed_out.error.as_deref(),
        Some("Execution exceeded timeout of 500ms")
    );

    let passed = BroadcastMessage::from(&ExecutionEvent::DataPassed {
        scope: scope.clone(),
        connection: connection.clone(),
        records: 3,
        timestamp: Utc::now(),
    });
    assert_eq!(passed.kind, MessageKind::DataFlow);
    assert_eq!(passed.node_id.as_deref(), Some("b"));
    assert_eq!(passed.status.as_deref(), Some("passed"));

    let progress = BroadcastMessage::from(&ExecutionEvent::NodeProgress {
        scope: scope.clone(),
        node_id: "b".to_string(),
        event: NodeEvent::Progress {
            percent: 50.0,
            message: None,
        },
        timestamp: Utc::now(),
    });
    assert_eq!(progress.kind, MessageKind::NodeProgress);
    assert!(progress.status.is_none());
    assert!(progress.data.is_some());

    let json = serde_json::to_value(&passed).unwrap();
    assert_eq!(json["type"], "data-flow");
    assert!(json.get("executionId").is_some());
    assert!(json.get("error").is_none());
}

#[tokio::test]
async fn test_pump_relays_bus_events() {
    common::init_tracing();
    let bus = EventBus::new(16);
    let broadcaster = Arc::new(EventBroadcaster::new());
    broadcaster.start(&bus);
    broadcaster.start(&bus);

    let scope = scope();
    let mut observer = broadcaster.connect(None);
    broadcaster.subscribe(observer.id, Room::Execution(scope.execution_id));

    bus.emit(started(&scope));
    let message = tokio::time::timeout(Duration::from_secs(1), observer.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status.as_deref(), Some("running"));

    broadcaster.shutdown().await;
    assert!(broadcaster.subscriptions().is_empty());
    assert!(observer.recv().await.is_none());
}

#[tokio::test]
async fn test_observe_flow_run_end_to_end() {
    let (runtime, _) = common::test_runtime();
    let mut flow = Flow::new("observed");
    flow.add_node(NodeInstance::new("first", "test.echo"));
    flow.add_node(NodeInstance::new("second", "test.echo"));
    flow.connect("first", "value", "second", "value");

    let mut observer = runtime.observe(None, [Room::Flow(flow.id)]);
    let trigger = Trigger::manual().with_inputs(HashMap::from([("value".to_string(), 1.0.into())]));
    runtime.run(&flow, trigger).await.unwrap();

    let mut statuses = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), observer.recv())
            .await
            .unwrap()
            .unwrap();
        if message.kind == MessageKind::ExecutionUpdate {
            let status = message.status.clone().unwrap_or_default();
            statuses.push(status.clone());
            if status == "success" {
                break;
            }
        }
    }

    assert_eq!(statuses, vec!["running", "success"]);
    runtime.shutdown().await;
}
