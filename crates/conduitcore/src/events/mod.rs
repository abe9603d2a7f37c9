mod base;

pub use base::{EventBus, EventEmitter, EventScope, ExecutionEvent, NodeEvent};
