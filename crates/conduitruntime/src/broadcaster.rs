//! Live fan-out of execution events to connected observers.
//!
//! Observers join rooms (`execution:<id>`, `flow:<id>`, `user:<id>`). For
//! every event on the bus the broadcaster works out which rooms it addresses
//! and hands one [`BroadcastMessage`] to each observer in any of them.
//! Delivery is live-only: nothing is buffered for observers that join later.

use chrono::{DateTime, Utc};
use conduitcore::{EventBus, ExecutionEvent, ExecutionId, FlowId, NodeId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ObserverId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Execution(ExecutionId),
    Flow(FlowId),
    User(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Execution(id) => write!(f, "execution:{}", id),
            Room::Flow(id) => write!(f, "flow:{}", id),
            Room::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid room name: {0}")]
pub struct InvalidRoom(pub String);

impl FromStr for Room {
    type Err = InvalidRoom;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidRoom(s.to_string());
        let (kind, id) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "execution" => Uuid::parse_str(id).map(Room::Execution).map_err(|_| invalid()),
            "flow" => Uuid::parse_str(id).map(Room::Flow).map_err(|_| invalid()),
            "user" if !id.is_empty() => Ok(Room::User(id.to_string())),
            _ => Err(invalid()),
        }
    }
}

/// What one observer is listening to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    pub observer_id: ObserverId,
    pub execution_ids: HashSet<ExecutionId>,
    pub flow_ids: HashSet<FlowId>,
    pub user_id: Option<String>,
    pub rooms: HashSet<Room>,
}

impl Subscription {
    fn new(observer_id: ObserverId, user_id: Option<String>) -> Self {
        Self {
            observer_id,
            user_id,
            ..Default::default()
        }
    }

    fn join(&mut self, room: Room) -> bool {
        match &room {
            Room::Execution(id) => {
                self.execution_ids.insert(*id);
            }
            Room::Flow(id) => {
                self.flow_ids.insert(*id);
            }
            Room::User(_) => {}
        }
        self.rooms.insert(room)
    }

    fn leave(&mut self, room: &Room) -> bool {
        match room {
            Room::Execution(id) => {
                self.execution_ids.remove(id);
            }
            Room::Flow(id) => {
                self.flow_ids.remove(id);
            }
            Room::User(_) => {}
        }
        self.rooms.remove(room)
    }

    fn listens_to(&self, rooms: &[Room]) -> bool {
        rooms.iter().any(|room| self.rooms.contains(room))
    }
}

struct Observer {
    subscription: Subscription,
    sender: mpsc::Sender<BroadcastMessage>,
}

/// Concurrent map of observer subscriptions. Operations on one observer are
/// serialized by the map's per-entry lock.
#[derive(Default)]
pub struct SubscriptionRegistry {
    observers: DashMap<ObserverId, Observer>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        user_id: Option<String>,
        sender: mpsc::Sender<BroadcastMessage>,
    ) -> ObserverId {
        let id = Uuid::new_v4();
        let mut subscription = Subscription::new(id, user_id.clone());
        if let Some(user) = user_id {
            subscription.join(Room::User(user));
        }
        self.observers.insert(
            id,
            Observer {
                subscription,
                sender,
            },
        );
        id
    }

    /// Returns false when the observer is unknown or already in the room
    pub fn join(&self, observer: ObserverId, room: Room) -> bool {
        self.observers
            .get_mut(&observer)
            .map(|mut entry| entry.subscription.join(room))
            .unwrap_or(false)
    }

    pub fn leave(&self, observer: ObserverId, room: &Room) -> bool {
        self.observers
            .get_mut(&observer)
            .map(|mut entry| entry.subscription.leave(room))
            .unwrap_or(false)
    }

    pub fn remove(&self, observer: ObserverId) -> bool {
        self.observers.remove(&observer).is_some()
    }

    pub fn subscription(&self, observer: ObserverId) -> Option<Subscription> {
        self.observers
            .get(&observer)
            .map(|entry| entry.subscription.clone())
    }

    pub fn room_members(&self, room: &Room) -> usize {
        self.observers
            .iter()
            .filter(|entry| entry.subscription.rooms.contains(room))
            .count()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn clear(&self) {
        self.observers.clear();
    }

    /// Send `message` once to every observer in any of `rooms`. Observers
    /// whose receiver is gone, or whose queue is full, are dropped.
    fn deliver(&self, rooms: &[Room], message: &BroadcastMessage) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        for entry in self.observers.iter() {
            if !entry.subscription.listens_to(rooms) {
                continue;
            }
            match entry.sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(observer_id = %entry.key(), "Observer queue full, disconnecting");
                    stale.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(observer_id = %entry.key(), "Dropping disconnected observer");
                    stale.push(*entry.key());
                }
            }
        }

        for observer in stale {
            self.observers.remove(&observer);
        }
        delivered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ExecutionUpdate,
    NodeUpdate,
    DataFlow,
    NodeProgress,
}

/// Transport-facing message derived from one domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<FlowId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    fn new(kind: MessageKind, event: &ExecutionEvent) -> Self {
        Self {
            kind,
            execution_id: event.execution_id(),
            flow_id: event.scope().flow_id,
            node_id: None,
            status: None,
            error: None,
            data: None,
            timestamp: event.timestamp(),
        }
    }

    fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    fn node(mut self, node_id: &NodeId) -> Self {
        self.node_id = Some(node_id.clone());
        self
    }

    fn error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&ExecutionEvent> for BroadcastMessage {
    fn from(event: &ExecutionEvent) -> Self {
        use MessageKind::*;

        match event {
            ExecutionEvent::ExecutionStarted { trigger, .. } => BroadcastMessage::new(ExecutionUpdate, event)
                .status("running")
                .data(json!({ "trigger": trigger })),
            ExecutionEvent::ExecutionCompleted {
                records_processed,
                duration_ms,
                ..
            } => BroadcastMessage::new(ExecutionUpdate, event)
                .status("success")
                .data(json!({ "recordsProcessed": records_processed, "durationMs": duration_ms })),
            ExecutionEvent::ExecutionFailed {
                error, duration_ms, ..
            } => BroadcastMessage::new(ExecutionUpdate, event)
                .status("failed")
                .error(error)
                .data(json!({ "durationMs": duration_ms })),
            ExecutionEvent::ExecutionCancelled { .. } => {
                BroadcastMessage::new(ExecutionUpdate, event).status("cancelled")
            }
            ExecutionEvent::ExecutionTimedOut { timeout_ms, .. } => BroadcastMessage::new(ExecutionUpdate, event)
                .status("timeout")
                .error(&format!("Execution exceeded timeout of {}ms", timeout_ms))
                .data(json!({ "timeoutMs": timeout_ms })),
            ExecutionEvent::ExecutionPaused { .. } => {
                BroadcastMessage::new(ExecutionUpdate, event).status("paused")
            }
            ExecutionEvent::ExecutionResumed { .. } => {
                BroadcastMessage::new(ExecutionUpdate, event).status("running")
            }
            ExecutionEvent::NodeStarted {
                node_id, node_type, ..
            } => BroadcastMessage::new(NodeUpdate, event)
                .node(node_id)
                .status("running")
                .data(json!({ "nodeType": node_type })),
            ExecutionEvent::NodeCompleted {
                node_id,
                outputs,
                records_processed,
                attempts,
                duration_ms,
                ..
            } => BroadcastMessage::new(NodeUpdate, event)
                .node(node_id)
                .status("success")
                .data(json!({
                    "outputs": outputs,
                    "recordsProcessed": records_processed,
                    "attempts": attempts,
                    "durationMs": duration_ms,
                })),
            ExecutionEvent::NodeFailed {
                node_id,
                error,
                attempt,
                will_retry,
                ..
            } => BroadcastMessage::new(NodeUpdate, event)
                .node(node_id)
                .status(if *will_retry { "retrying" } else { "failed" })
                .error(error)
                .data(json!({ "attempt": attempt })),
            ExecutionEvent::NodeProgress {
                node_id, event: update, ..
            } => BroadcastMessage::new(NodeProgress, event)
                .node(node_id)
                .data(json!(update)),
            ExecutionEvent::DataPassed {
                connection, records, ..
            } => BroadcastMessage::new(DataFlow, event)
                .node(&connection.to_node_id)
                .status("passed")
                .data(json!({ "connection": connection, "records": records })),
            ExecutionEvent::DataError {
                connection, error, ..
            } => BroadcastMessage::new(DataFlow, event)
                .node(&connection.to_node_id)
                .status("error")
                .error(error)
                .data(json!({ "connection": connection })),
        }
    }
}

/// Receiving end handed to a connected observer
pub struct ObserverHandle {
    pub id: ObserverId,
    receiver: mpsc::Receiver<BroadcastMessage>,
}

impl ObserverHandle {
    /// Next message, or `None` once the observer is disconnected and its
    /// queue drained
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        self.receiver.try_recv().ok()
    }
}

pub const DEFAULT_OBSERVER_BUFFER: usize = 1024;

/// Owns the subscription registry and the task pumping events off the bus
pub struct EventBroadcaster {
    subscriptions: SubscriptionRegistry,
    observer_buffer: usize,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_observer_buffer(DEFAULT_OBSERVER_BUFFER)
    }

    /// Each observer may hold at most `capacity` undelivered messages. An
    /// observer that falls further behind is disconnected.
    pub fn with_observer_buffer(capacity: usize) -> Self {
        Self {
            subscriptions: SubscriptionRegistry::new(),
            observer_buffer: capacity.max(1),
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
        }
    }

    /// Spawn the task that relays events from `bus` to observers. Calling it
    /// again while the task is alive does nothing.
    pub fn start(self: &Arc<Self>, bus: &EventBus) {
        let mut pump = self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut events = bus.subscribe();
        let broadcaster = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        *pump = Some(tokio::spawn(async move {
            tracing::info!("Event broadcaster started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            broadcaster.publish(&event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Broadcaster lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            tracing::info!("Event broadcaster stopped");
        }));
    }

    /// Stop relaying and disconnect every observer. A broadcaster is not
    /// restarted after shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Broadcaster task ended abnormally");
            }
        }
        self.subscriptions.clear();
    }

    /// Register a new observer. A known user joins their own user room.
    pub fn connect(&self, user_id: Option<String>) -> ObserverHandle {
        let (sender, receiver) = mpsc::channel(self.observer_buffer);
        let id = self.subscriptions.register(user_id.clone(), sender);
        tracing::debug!(observer_id = %id, user_id = ?user_id, "Observer connected");
        ObserverHandle { id, receiver }
    }

    pub fn disconnect(&self, observer: ObserverId) -> bool {
        let removed = self.subscriptions.remove(observer);
        if removed {
            tracing::debug!(observer_id = %observer, "Observer disconnected");
        }
        removed
    }

    pub fn subscribe(&self, observer: ObserverId, room: Room) -> bool {
        tracing::debug!(observer_id = %observer, room = %room, "Subscribe");
        self.subscriptions.join(observer, room)
    }

    pub fn unsubscribe(&self, observer: ObserverId, room: &Room) -> bool {
        tracing::debug!(observer_id = %observer, room = %room, "Unsubscribe");
        self.subscriptions.leave(observer, room)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn room_members(&self, room: &Room) -> usize {
        self.subscriptions.room_members(room)
    }

    /// Deliver one event to every observer in a room it addresses and return
    /// how many observers received it. Never fails.
    pub fn publish(&self, event: &ExecutionEvent) -> usize {
        let rooms = rooms_for(event);
        let message = BroadcastMessage::from(event);
        let delivered = self.subscriptions.deliver(&rooms, &message);
        tracing::debug!(kind = event.kind(), delivered, "Broadcast event");
        delivered
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

fn rooms_for(event: &ExecutionEvent) -> Vec<Room> {
    let scope = event.scope();
    let mut rooms = vec![Room::Execution(scope.execution_id)];
    if let Some(flow_id) = scope.flow_id {
        rooms.push(Room::Flow(flow_id));
    }
    if let Some(user_id) = &scope.user_id {
        rooms.push(Room::User(user_id.clone()));
    }
    rooms
}
