//! Wire-format types exchanged over the message broker, and the boundary
//! validation applied to every inbound and outbound payload.
//!
//! Every message crossing a queue boundary is schema-checked before it's
//! trusted: field-level constraints via `validator` derive macros, plus a
//! `validate_contract()` per type for the cross-field invariants derive
//! macros can't express.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

/// Errors raised when a wire payload fails schema or semantic validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("field validation failed: {0}")]
    Invalid(String),
}

impl From<validator::ValidationErrors> for ContractError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ContractError::Invalid(errors.to_string())
    }
}

impl From<serde_json::Error> for ContractError {
    fn from(err: serde_json::Error) -> Self {
        ContractError::Malformed(err.to_string())
    }
}

/// The five task kinds this system dispatches to AI workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Generate,
    Optimize,
    Fusion,
    Analyze,
    Expand,
}

/// Scheduling priority. Converts to the numeric weight the scheduler's
/// dispatch queue orders on via [`Priority::weight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric dispatch weight: low=1, normal=5, high=8, urgent=10. An
    /// unrecognized priority on the wire deserializes to `Normal` via
    /// [`Priority::from_wire_str`] rather than failing validation.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 8,
            Priority::Urgent => 10,
        }
    }

    pub fn from_wire_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Severity class carried on a [`TaskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

/// Per-task metadata carried alongside a [`TaskMessage`]: model selection,
/// sampling parameters, timeout override, and correlation/tagging fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct TaskMetadata {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    /// Per-task timeout override, in milliseconds. Falls back to
    /// [`crate::config::SchedulerDefaults::task_timeout`] when absent.
    pub timeout_ms: Option<u64>,
    pub original_request_id: Option<Uuid>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub batch_id: Option<Uuid>,
}

/// A task submitted for scheduling, as it travels over `llm.direct`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub task_type: TaskType,
    #[validate(length(min = 1, message = "inputs must contain at least one element"))]
    pub inputs: Vec<String>,
    pub context: Option<String>,
    pub instruction: Option<String>,
    pub node_id: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    #[serde(default)]
    pub retry_count: u8,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskMessage {
    /// Validate schema-derived field constraints plus the cross-field
    /// invariants `validator` can't express declaratively: temperature in
    /// `[0, 2]` and retry_count capped at 3, per the data model's bounds.
    pub fn validate_contract(&self) -> Result<(), ContractError> {
        self.validate()?;
        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(ContractError::Invalid(format!(
                    "temperature {temp} outside [0, 2]"
                )));
            }
        }
        if self.retry_count > 3 {
            return Err(ContractError::Invalid(format!(
                "retry_count {} exceeds maximum of 3",
                self.retry_count
            )));
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, ContractError> {
        self.validate_contract()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, ContractError> {
        let msg: Self = serde_json::from_slice(bytes)?;
        msg.validate_contract()?;
        Ok(msg)
    }

    /// Per-task timeout, falling back to the scheduler default when the
    /// metadata override is absent.
    pub fn effective_timeout(&self, default: std::time::Duration) -> std::time::Duration {
        self.metadata
            .timeout_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or(default)
    }
}

/// Per-model accounting carried on a successful [`ResultPayload`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessingMetadata {
    pub model: String,
    pub token_count: u32,
    pub temperature: f64,
    pub processing_steps: Option<Vec<String>>,
    pub request_id: Uuid,
    pub processing_time_ms: u64,
    pub cost: Option<f64>,
}

/// The successful output of a task.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResultPayload {
    #[validate(length(min = 1, message = "result content must not be empty"))]
    pub content: String,
    pub title: Option<String>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub reasoning: Option<String>,
    pub alternatives: Option<Vec<String>>,
    pub semantic_type: Option<String>,
    pub processing_metadata: ProcessingMetadata,
}

/// A failed task's error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub severity: ErrorSeverity,
}

/// Outcome of a completed (or failed) task, as it travels over `ai.results`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResultMessage {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub node_id: String,
    pub project_id: String,
    pub user_id: String,
    pub success: bool,
    #[validate]
    pub result: Option<ResultPayload>,
    pub error: Option<TaskError>,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResultMessage {
    pub fn validate_contract(&self) -> Result<(), ContractError> {
        self.validate()?;
        if let Some(result) = &self.result {
            if let Some(confidence) = result.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(ContractError::Invalid(format!(
                        "confidence {confidence} outside [0, 1]"
                    )));
                }
            }
        }
        if self.success && self.result.is_none() {
            return Err(ContractError::Invalid(
                "successful result must carry a result payload".to_string(),
            ));
        }
        if !self.success && self.error.is_none() {
            return Err(ContractError::Invalid(
                "failed result must carry an error".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, ContractError> {
        self.validate_contract()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, ContractError> {
        let msg: Self = serde_json::from_slice(bytes)?;
        msg.validate_contract()?;
        Ok(msg)
    }
}

/// Request to cancel a queued or in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub task_id: Uuid,
    pub reason: Option<String>,
}

impl CancelMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, ContractError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Batch submission options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub concurrency: u8,
    pub fail_fast: bool,
    pub collect_results: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            fail_fast: false,
            collect_results: true,
        }
    }
}

impl BatchOptions {
    pub fn validate_contract(&self) -> Result<(), ContractError> {
        if !(1..=10).contains(&self.concurrency) {
            return Err(ContractError::Invalid(format!(
                "batch concurrency {} outside [1, 10]",
                self.concurrency
            )));
        }
        Ok(())
    }
}

/// A batch submission: several tasks sharing a batch id for correlation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchEnvelope {
    pub batch_id: Uuid,
    #[validate(length(min = 1, message = "a batch must contain at least one task"))]
    #[validate]
    pub tasks: Vec<TaskMessage>,
    #[serde(default)]
    pub options: BatchOptions,
    pub timestamp: DateTime<Utc>,
}

impl BatchEnvelope {
    pub fn validate_contract(&self) -> Result<(), ContractError> {
        self.validate()?;
        self.options.validate_contract()?;
        for task in &self.tasks {
            task.validate_contract()?;
        }
        Ok(())
    }
}

/// Broad category a workspace event falls under, used to pick the routing
/// key prefix and backing exchange in [`crate::events::EventPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Node,
    Project,
    User,
    Ai,
    System,
}

impl EventCategory {
    pub fn routing_prefix(self) -> &'static str {
        match self {
            EventCategory::Node => "node",
            EventCategory::Project => "project",
            EventCategory::User => "user",
            EventCategory::Ai => "ai",
            EventCategory::System => "system",
        }
    }

    /// Envelope priority by event class: system=8, ai=7, default=5.
    pub fn priority(self) -> u8 {
        match self {
            EventCategory::System => 8,
            EventCategory::Ai => 7,
            _ => 5,
        }
    }
}

/// A topic event published to `events.topic` (or `realtime.fanout` for
/// `system.*` events).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub category: EventCategory,
    #[validate(length(min = 1, message = "event name must not be empty"))]
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl EventEnvelope {
    pub fn validate_contract(&self) -> Result<(), ContractError> {
        self.validate()?;
        Ok(())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, ContractError> {
        self.validate_contract()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, ContractError> {
        let env: Self = serde_json::from_slice(bytes)?;
        env.validate_contract()?;
        Ok(env)
    }

    /// Routing key an event is published/bound under: `"{category}.{name}"`.
    pub fn routing_key(category: EventCategory, name: &str) -> String {
        format!("{}.{}", category.routing_prefix(), name)
    }
}
