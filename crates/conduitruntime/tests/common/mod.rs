//! Scripted nodes and helpers shared by the runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use conduitcore::{
    ExecutionId, ExecutionStatus, FieldSpec, FieldType, Node, NodeContext, NodeDefinition,
    NodeError, NodeOutput, RetryPolicy, Schedule, Trigger, Value,
};
use conduitruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Copies inputs to outputs and adds every config entry as an output
pub struct EchoNode {
    config: HashMap<String, Value>,
}

#[async_trait]
impl Node for EchoNode {
    fn node_type(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut outputs = ctx.inputs.clone();
        outputs.extend(self.config.clone());
        Ok(NodeOutput {
            outputs,
            records_processed: 1,
        })
    }
}

/// Fails every attempt with `config.message`
pub struct FailingNode {
    message: String,
}

#[async_trait]
impl Node for FailingNode {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Err(NodeError::ExecutionFailed(self.message.clone()))
    }
}

/// Fails the first `config.failures` attempts, then echoes its inputs
pub struct FlakyNode {
    failures: u32,
}

#[async_trait]
impl Node for FlakyNode {
    fn node_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if ctx.attempt <= self.failures {
            return Err(NodeError::ExecutionFailed(format!(
                "attempt {} failed",
                ctx.attempt
            )));
        }
        Ok(NodeOutput {
            outputs: ctx.inputs,
            records_processed: 1,
        })
    }
}

/// Sleeps for `config.delay_ms` without watching for cancellation
pub struct SlowNode {
    delay: Duration,
}

#[async_trait]
impl Node for SlowNode {
    fn node_type(&self) -> &str {
        "test.slow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        tokio::time::sleep(self.delay).await;
        Ok(NodeOutput {
            outputs: ctx.inputs,
            records_processed: 1,
        })
    }
}

/// Rejects any input set lacking `value`
pub struct StrictNode;

#[async_trait]
impl Node for StrictNode {
    fn node_type(&self) -> &str {
        "test.strict"
    }

    fn validate(&self, inputs: &HashMap<String, Value>) -> Result<(), NodeError> {
        conduitcore::check_inputs(&strict_definition().input_schema, inputs)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput {
            outputs: ctx.inputs,
            records_processed: 1,
        })
    }
}

/// Counts invocations and the peak number running at once
#[derive(Clone, Default)]
pub struct Probe {
    pub calls: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl Probe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct CountingNode {
    probe: Probe,
    delay: Duration,
}

#[async_trait]
impl Node for CountingNode {
    fn node_type(&self) -> &str {
        "test.count"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput {
            outputs: ctx.inputs,
            records_processed: 1,
        })
    }
}

fn config_u64(config: &HashMap<String, Value>, key: &str, default: u64) -> u64 {
    config
        .get(key)
        .and_then(|v| v.as_f64())
        .map(|v| v as u64)
        .unwrap_or(default)
}

pub fn echo_definition() -> NodeDefinition {
    NodeDefinition::new("test.echo", "1.0.0", "test")
        .with_input("value", FieldSpec::optional(FieldType::Any))
        .with_output("value", FieldSpec::optional(FieldType::Any))
}

pub fn strict_definition() -> NodeDefinition {
    NodeDefinition::new("test.strict", "1.0.0", "test")
        .with_input("value", FieldSpec::required(FieldType::Number))
        .with_output("value", FieldSpec::required(FieldType::Number))
}

/// Registry with every scripted node. The probe observes `test.count`.
pub fn test_registry() -> (NodeRegistry, Probe) {
    let probe = Probe::default();
    let mut registry = NodeRegistry::new();

    registry.register_fn(echo_definition(), |config| {
        Ok(Box::new(EchoNode {
            config: config.clone(),
        }) as Box<dyn Node>)
    });
    registry.register_fn(NodeDefinition::new("test.fail", "1.0.0", "test"), |config| {
        let message = config
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("boom")
            .to_string();
        Ok(Box::new(FailingNode { message }) as Box<dyn Node>)
    });
    registry.register_fn(NodeDefinition::new("test.flaky", "1.0.0", "test"), |config| {
        Ok(Box::new(FlakyNode {
            failures: config_u64(config, "failures", 1) as u32,
        }) as Box<dyn Node>)
    });
    registry.register_fn(NodeDefinition::new("test.slow", "1.0.0", "test"), |config| {
        Ok(Box::new(SlowNode {
            delay: Duration::from_millis(config_u64(config, "delay_ms", 100)),
        }) as Box<dyn Node>)
    });
    registry.register_fn(strict_definition(), |_| Ok(Box::new(StrictNode) as Box<dyn Node>));

    let counted = probe.clone();
    registry.register_fn(NodeDefinition::new("test.count", "1.0.0", "test"), move |config| {
        Ok(Box::new(CountingNode {
            probe: counted.clone(),
            delay: Duration::from_millis(config_u64(config, "delay_ms", 20)),
        }) as Box<dyn Node>)
    });

    (registry, probe)
}

pub fn test_runtime() -> (FlowRuntime, Probe) {
    test_runtime_with(RuntimeConfig::default())
}

pub fn test_runtime_with(config: RuntimeConfig) -> (FlowRuntime, Probe) {
    init_tracing();
    let (registry, probe) = test_registry();
    (FlowRuntime::with_config(registry, config), probe)
}

/// Manual trigger whose schedule carries a retry policy and optional deadline
pub fn with_policy(flow_id: conduitcore::FlowId, retry: RetryPolicy, timeout_ms: Option<u64>) -> Trigger {
    let mut schedule = Schedule::new(flow_id).with_retry(retry.max_retries, retry.retry_delay_ms);
    if let Some(ms) = timeout_ms {
        schedule = schedule.with_timeout(ms);
    }
    Trigger::scheduled(schedule)
}

/// Poll the store until the execution reaches `status`
pub async fn wait_for_status(runtime: &FlowRuntime, id: ExecutionId, status: ExecutionStatus) -> bool {
    for _ in 0..200 {
        if let Ok(execution) = runtime.orchestrator().get_execution(id).await {
            if execution.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
