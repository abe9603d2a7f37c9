//! Standard node library
//!
//! Collection of built-in nodes for common operations. Every node declares
//! its schemas up front so the compatibility validator can reason about it
//! without constructing an instance.

mod debug;
mod filter;
mod http;
mod time;
mod transform;

pub use debug::{DebugNode, DebugNodeFactory};
pub use filter::{FilterNode, FilterNodeFactory};
pub use http::{HttpRequestNode, HttpRequestNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};
pub use transform::{
    JsonParseNode, JsonParseNodeFactory, JsonStringifyNode, JsonStringifyNodeFactory,
};

use conduitruntime::NodeRegistry;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(debug::definition(), DebugNodeFactory);
    registry.register(filter::definition(), FilterNodeFactory);
    registry.register(http::definition(), HttpRequestNodeFactory);
    registry.register(transform::json_parse_definition(), JsonParseNodeFactory);
    registry.register(transform::json_stringify_definition(), JsonStringifyNodeFactory);
    registry.register(time::definition(), DelayNodeFactory);
}

/// Registry pre-populated with the standard nodes
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
