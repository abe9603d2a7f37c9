use crate::{FlowId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub type ScheduleId = Uuid;

/// Per-node retry policy. The delay between attempts is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 1000,
        }
    }
}

/// A recurring or on-demand trigger bound to a flow. Cron timing is owned by
/// the trigger source; the engine only reads the retry and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: ScheduleId,
    pub flow_id: FlowId,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Deadline for a whole execution
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Schedule {
    pub fn new(flow_id: FlowId) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            cron_expression: None,
            max_retries: 0,
            retry_delay_ms: 0,
            timeout_ms: None,
            enabled: true,
            owner_id: None,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Schedule,
    Retry,
}

/// What started an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub kind: TriggerKind,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Seed values handed to nodes without inbound connections
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

impl Trigger {
    pub fn manual() -> Self {
        Self {
            kind: TriggerKind::Manual,
            schedule: None,
            user_id: None,
            inputs: HashMap::new(),
        }
    }

    pub fn scheduled(schedule: Schedule) -> Self {
        let user_id = schedule.owner_id.clone();
        Self {
            kind: TriggerKind::Schedule,
            schedule: Some(schedule),
            user_id,
            inputs: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn schedule_id(&self) -> Option<ScheduleId> {
        self.schedule.as_ref().map(|s| s.id)
    }

    /// Schedule policy when present, otherwise the supplied default
    pub fn retry_policy(&self, fallback: RetryPolicy) -> RetryPolicy {
        self.schedule
            .as_ref()
            .map(Schedule::retry_policy)
            .unwrap_or(fallback)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.schedule
            .as_ref()
            .and_then(|s| s.timeout_ms)
            .map(Duration::from_millis)
    }
}
