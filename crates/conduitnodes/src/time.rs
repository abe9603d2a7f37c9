use async_trait::async_trait;
use conduitcore::{Node, NodeContext, NodeDefinition, NodeError, NodeOutput, Value};
use conduitruntime::NodeFactory;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

pub const NODE_TYPE: &str = "time.delay";

const DEFAULT_DELAY_MS: u64 = 1000;

/// Inputs pass through untouched, so no schema is declared.
pub fn definition() -> NodeDefinition {
    NodeDefinition::new(NODE_TYPE, "1.0.0", "time")
        .with_description("Delay execution for specified milliseconds")
}

/// Delay execution for a specified duration
pub struct DelayNode {
    delay: Duration,
}

impl DelayNode {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        NODE_TYPE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.events
            .info(format!("Delaying for {}ms", self.delay.as_millis()));

        tokio::select! {
            _ = sleep(self.delay) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        Ok(NodeOutput {
            outputs: ctx.inputs,
            records_processed: 0,
        })
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let delay_ms = match config.get("delay_ms") {
            None => DEFAULT_DELAY_MS,
            Some(value) => match value.as_f64() {
                Some(ms) if ms >= 0.0 && ms.is_finite() => ms as u64,
                _ => {
                    return Err(NodeError::Configuration(
                        "'delay_ms' must be a non-negative number".to_string(),
                    ))
                }
            },
        };
        Ok(Box::new(DelayNode::new(Duration::from_millis(delay_ms))))
    }
}
