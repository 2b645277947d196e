//! In-memory AI task lifecycle tracking and dispatch over the broker.
//!
//! The task map is a single `tokio::sync::Mutex<HashMap<...>>` mutated only
//! from methods on this struct (never reached into from outside), which is
//! the single-writer discipline the rest of this crate follows - the maps
//! are small and every operation holding the lock is short, so a dedicated
//! actor task would only add indirection. Observability follows
//! [`crate::connection::ConnectionManager`]'s pattern: an explicit
//! `broadcast` channel of typed events rather than an inheritance-based
//! event emitter.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Ack, BrokerError, DeliveryHandler, MessageBroker, PublishOptions};
use crate::config::SchedulerDefaults;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::contracts::{
    BatchEnvelope, BatchOptions, CancelMessage, ContractError, Priority, ResultMessage, TaskMessage,
    TaskMetadata, TaskType,
};

/// Canonical task-dispatch exchange (direct).
const TASKS_EXCHANGE: &str = "llm.direct";
/// Canonical results fan-in queue.
const RESULTS_QUEUE: &str = "ai.results";
const ROUTING_KEY_PROCESS: &str = "ai.process";
const ROUTING_KEY_BATCH: &str = "ai.batch";
const ROUTING_KEY_CANCEL: &str = "task.cancel";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("batch must contain at least one task")]
    EmptyBatch,
}

/// Lifecycle state of a scheduled task, per the queued -> processing ->
/// (completed | failed | timed_out | cancelled) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }
}

/// A tracked task and its current lifecycle state. This record is
/// destroyed the instant it reaches a terminal status - callers observe the
/// transition only through the corresponding [`SchedulerEvent`], not by
/// polling [`AITaskScheduler::task_status`] afterwards.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: Priority,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u8,
    pub batch_id: Option<Uuid>,
}

/// Aggregate counts returned by [`AITaskScheduler::stats`]. Since terminal
/// records are removed immediately, the terminal counters are lifetime
/// totals rather than a live snapshot.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

/// Events observers can subscribe to via [`AITaskScheduler::subscribe`].
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskScheduled {
        task_id: Uuid,
        task_type: TaskType,
        node_id: String,
        priority: Priority,
    },
    TaskStatusUpdated {
        task_id: Uuid,
        status: TaskStatus,
    },
    TaskCompleted {
        task_id: Uuid,
        node_id: String,
        success: bool,
        result: ResultMessage,
    },
    TaskTimeout {
        task_id: Uuid,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    BatchScheduled {
        batch_id: Uuid,
        task_count: usize,
        options: BatchOptions,
    },
}

/// Schedules AI tasks onto the broker and tracks their lifecycle until a
/// terminal state is reached or the per-task timeout fires.
pub struct AITaskScheduler {
    broker: Arc<dyn MessageBroker>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    events: broadcast::Sender<SchedulerEvent>,
    defaults: SchedulerDefaults,
    stats: Mutex<SchedulerStats>,
}

impl AITaskScheduler {
    pub fn new(broker: Arc<dyn MessageBroker>, defaults: SchedulerDefaults) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            broker,
            tasks: Mutex::new(HashMap::new()),
            events,
            defaults,
            stats: Mutex::new(SchedulerStats::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Submit a task of any [`TaskType`] for dispatch. Publishes to
    /// `llm.direct` with routing key `ai.process` and arms a timeout timer
    /// bounded by the task's metadata override or `scheduler.task_timeout`.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_task(
        self: &Arc<Self>,
        task_type: TaskType,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
        temperature: Option<f64>,
        metadata: TaskMetadata,
    ) -> Result<Uuid, SchedulerError> {
        let message = TaskMessage {
            task_id: Uuid::new_v4(),
            task_type,
            inputs,
            context: None,
            instruction: None,
            node_id: node_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            priority,
            timestamp: Utc::now(),
            temperature,
            retry_count: 0,
            metadata,
        };
        self.dispatch(message, None).await
    }

    pub async fn schedule_generate(
        self: &Arc<Self>,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule_task(
            TaskType::Generate,
            inputs,
            node_id,
            project_id,
            user_id,
            priority,
            None,
            TaskMetadata::default(),
        )
        .await
    }

    pub async fn schedule_optimize(
        self: &Arc<Self>,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule_task(
            TaskType::Optimize,
            inputs,
            node_id,
            project_id,
            user_id,
            priority,
            None,
            TaskMetadata::default(),
        )
        .await
    }

    pub async fn schedule_fusion(
        self: &Arc<Self>,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule_task(
            TaskType::Fusion,
            inputs,
            node_id,
            project_id,
            user_id,
            priority,
            None,
            TaskMetadata::default(),
        )
        .await
    }

    pub async fn schedule_analyze(
        self: &Arc<Self>,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule_task(
            TaskType::Analyze,
            inputs,
            node_id,
            project_id,
            user_id,
            priority,
            None,
            TaskMetadata::default(),
        )
        .await
    }

    pub async fn schedule_expand(
        self: &Arc<Self>,
        inputs: Vec<String>,
        node_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Result<Uuid, SchedulerError> {
        self.schedule_task(
            TaskType::Expand,
            inputs,
            node_id,
            project_id,
            user_id,
            priority,
            None,
            TaskMetadata::default(),
        )
        .await
    }

    /// Schedule several tasks as one correlated batch: each task is
    /// individually published (arming its own timer so per-task timeouts
    /// still fire independently), tagged with a shared `batch_id`, after a
    /// single batch envelope is published to `ai.batch` for observers that
    /// want to see the whole batch as one unit.
    pub async fn schedule_batch(
        self: &Arc<Self>,
        mut tasks: Vec<TaskMessage>,
        options: BatchOptions,
    ) -> Result<Uuid, SchedulerError> {
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyBatch);
        }
        let batch_id = Uuid::new_v4();
        for task in &mut tasks {
            task.metadata.batch_id = Some(batch_id);
        }
        let envelope = BatchEnvelope {
            batch_id,
            tasks: tasks.clone(),
            options: options.clone(),
            timestamp: Utc::now(),
        };
        envelope.validate_contract()?;

        let envelope_body = envelope.to_wire()?;
        self.broker
            .publish(
                TASKS_EXCHANGE,
                ROUTING_KEY_BATCH,
                &envelope_body,
                PublishOptions {
                    correlation_id: Some(batch_id.to_string()),
                    message_type: Some("ai_batch".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let task_count = tasks.len();
        for task in tasks {
            self.dispatch(task, Some(batch_id)).await?;
        }

        let _ = self.events.send(SchedulerEvent::BatchScheduled {
            batch_id,
            task_count,
            options,
        });
        info!(%batch_id, count = task_count, "batch scheduled");
        Ok(batch_id)
    }

    async fn dispatch(self: &Arc<Self>, message: TaskMessage, batch_id: Option<Uuid>) -> Result<Uuid, SchedulerError> {
        message.validate_contract()?;
        let task_id = message.task_id;
        let now = Utc::now();
        let record = TaskRecord {
            task_id,
            task_type: message.task_type,
            status: TaskStatus::Queued,
            priority: message.priority,
            node_id: message.node_id.clone(),
            created_at: now,
            updated_at: now,
            retry_count: message.retry_count,
            batch_id,
        };

        let body = message.to_wire()?;
        let timeout = message.effective_timeout(self.defaults.task_timeout);
        self.broker
            .publish(
                TASKS_EXCHANGE,
                ROUTING_KEY_PROCESS,
                &body,
                PublishOptions {
                    priority: message.priority.weight(),
                    correlation_id: Some(task_id.to_string()),
                    message_type: Some("ai_task".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.tasks.lock().await.insert(task_id, record);
        let _ = self.events.send(SchedulerEvent::TaskScheduled {
            task_id,
            task_type: message.task_type,
            node_id: message.node_id,
            priority: message.priority,
        });
        self.arm_timeout(task_id, timeout);
        Ok(task_id)
    }

    fn arm_timeout(self: &Arc<Self>, task_id: Uuid, timeout: std::time::Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            sleep(timeout).await;
            scheduler.handle_timeout(task_id).await;
        });
    }

    /// Remove `task_id` if present and not already terminal, returning the
    /// record so the caller can build the right event from it. Terminal
    /// states are destroyed immediately, so a removed record can never be
    /// re-armed or double-transitioned.
    async fn take_active(&self, task_id: Uuid) -> Option<TaskRecord> {
        let mut tasks = self.tasks.lock().await;
        let is_active = tasks.get(&task_id).map(|r| !r.status.is_terminal()).unwrap_or(false);
        if is_active {
            tasks.remove(&task_id)
        } else {
            None
        }
    }

    async fn handle_timeout(&self, task_id: Uuid) {
        if self.take_active(task_id).await.is_some() {
            warn!(%task_id, "task timed out");
            self.stats.lock().await.timed_out += 1;
            let _ = self.events.send(SchedulerEvent::TaskTimeout { task_id });
        }
    }

    /// Record a result delivered on `ai.results`, transitioning the task to
    /// `Completed` or `Failed` and removing its in-memory record. No-op
    /// (besides a warning) if the task is unknown or already terminal,
    /// since a delayed result can race a timeout or cancel.
    pub async fn record_result(&self, result: ResultMessage) -> Result<(), SchedulerError> {
        result.validate_contract()?;
        let Some(record) = self.take_active(result.task_id).await else {
            warn!(task_id = %result.task_id, "result received for unknown or already-terminal task");
            return Err(SchedulerError::NotFound(result.task_id));
        };

        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        {
            let mut stats = self.stats.lock().await;
            if result.success {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
        }
        let task_id = result.task_id;
        let node_id = record.node_id;
        let success = result.success;
        let _ = self.events.send(SchedulerEvent::TaskStatusUpdated { task_id, status });
        let _ = self.events.send(SchedulerEvent::TaskCompleted {
            task_id,
            node_id,
            success,
            result,
        });
        Ok(())
    }

    pub async fn mark_processing(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let record = tasks.get_mut(&task_id).ok_or(SchedulerError::NotFound(task_id))?;
        if record.status.is_terminal() {
            return Err(SchedulerError::NotFound(task_id));
        }
        record.status = TaskStatus::Processing;
        record.updated_at = Utc::now();
        let _ = self.events.send(SchedulerEvent::TaskStatusUpdated {
            task_id,
            status: TaskStatus::Processing,
        });
        Ok(())
    }

    /// Publish a cancel control message on `llm.direct`/`task.cancel`
    /// (correlation id = task id), then transition the task to `Cancelled`
    /// and remove its record. The engine is expected to honor the cancel by
    /// not starting, or aborting, the task.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), SchedulerError> {
        let Some(_) = self.take_active(task_id).await else {
            return Err(SchedulerError::NotFound(task_id));
        };

        let cancel = CancelMessage {
            task_id,
            reason: None,
        };
        let body = cancel.to_wire()?;
        self.broker
            .publish(
                TASKS_EXCHANGE,
                ROUTING_KEY_CANCEL,
                &body,
                PublishOptions {
                    correlation_id: Some(task_id.to_string()),
                    message_type: Some("task_cancel".to_string()),
                    ..Default::default()
                },
            )
            .await?;

        self.stats.lock().await.cancelled += 1;
        let _ = self.events.send(SchedulerEvent::TaskCancelled { task_id });
        Ok(())
    }

    pub async fn task_status(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    pub async fn active_tasks(&self) -> Vec<TaskRecord> {
        self.tasks.lock().await.values().cloned().collect()
    }

    /// Consume `ai.results` until the channel closes, applying each
    /// delivered [`ResultMessage`] via [`Self::record_result`]. Malformed
    /// payloads are rejected without requeue; results for unknown or
    /// already-terminal tasks are acked anyway since retrying them can
    /// never succeed and the canonical task state lives in the external
    /// store.
    pub async fn run_result_consumer(self: &Arc<Self>, consumer_tag: &str) -> Result<(), SchedulerError> {
        let scheduler = Arc::clone(self);
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let scheduler = Arc::clone(&scheduler);
            async move {
                match ResultMessage::from_wire(&delivery.body) {
                    Ok(result) => match scheduler.record_result(result).await {
                        Ok(()) | Err(SchedulerError::NotFound(_)) => Ack::Ack,
                        Err(err) => {
                            warn!(error = %err, "failed to apply task result");
                            Ack::NackRequeue
                        }
                    },
                    Err(err) => {
                        warn!(error = %err, "dropping malformed result message");
                        Ack::Reject
                    }
                }
            }
            .boxed()
        });
        self.broker.consume(RESULTS_QUEUE, consumer_tag, handler).await?;
        Ok(())
    }

    /// Retry loop for [`Self::run_result_consumer`], closing the race where
    /// the scheduler starts before the broker's channels are established:
    /// retries up to `consumer_setup_max_retries` times with linearly
    /// growing delay until the broker reports ready.
    pub async fn run_result_consumer_with_retry(self: &Arc<Self>, consumer_tag: &str) -> Result<(), SchedulerError> {
        let max_attempts = self.defaults.consumer_setup_max_retries.max(1);
        for attempt in 0..max_attempts {
            if self.broker.is_ready() {
                return self.run_result_consumer(consumer_tag).await;
            }
            sleep(std::time::Duration::from_millis(100 * (attempt as u64 + 1))).await;
        }
        self.run_result_consumer(consumer_tag).await
    }

    /// Keep the result consumer alive across reconnects. `run_result_consumer`
    /// returns once its delivery stream ends (the channel it was declared on
    /// is gone), so this loops forever: run the consumer, and once it drops
    /// out, wait for the connection to report [`ConnectionEvent::Reconnected`]
    /// before registering it again. The queue itself is durable and survives
    /// the channel loss; only the consumer registration needs rebuilding.
    pub async fn run_supervised(self: &Arc<Self>, connection: Arc<ConnectionManager>, consumer_tag: &str) {
        loop {
            let mut events = connection.subscribe();

            if let Err(err) = self.run_result_consumer_with_retry(consumer_tag).await {
                warn!(error = %err, "result consumer exited with error, awaiting reconnect");
            } else {
                info!("result consumer stream ended, awaiting reconnect");
            }

            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Reconnected { attempt }) => {
                        info!(attempt, "reconnected, re-registering result consumer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let mut current = self.stats.lock().await.clone();
        let tasks = self.tasks.lock().await;
        for record in tasks.values() {
            match record.status {
                TaskStatus::Queued => current.queued += 1,
                TaskStatus::Processing => current.processing += 1,
                _ => {}
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::contracts::{ErrorSeverity, ProcessingMetadata, ResultPayload, TaskError};
    use std::time::Duration;

    fn test_defaults() -> SchedulerDefaults {
        SchedulerDefaults {
            task_timeout: Duration::from_millis(50),
            confirm_timeout: Duration::from_millis(50),
            consumer_setup_max_retries: 1,
            batch_default_concurrency: 1,
        }
    }

    fn success_result(task_id: Uuid, task_type: TaskType, node_id: &str) -> ResultMessage {
        ResultMessage {
            task_id,
            task_type,
            node_id: node_id.to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            success: true,
            result: Some(ResultPayload {
                content: "y".to_string(),
                title: None,
                confidence: Some(0.9),
                tags: vec![],
                reasoning: None,
                alternatives: None,
                semantic_type: None,
                processing_metadata: ProcessingMetadata {
                    model: "gpt".to_string(),
                    token_count: 1,
                    temperature: 0.7,
                    processing_steps: None,
                    request_id: Uuid::new_v4(),
                    processing_time_ms: 10,
                    cost: None,
                },
            }),
            error: None,
            processing_time_ms: 10,
            timestamp: Utc::now(),
        }
    }

    fn failure_result(task_id: Uuid, task_type: TaskType, node_id: &str) -> ResultMessage {
        ResultMessage {
            task_id,
            task_type,
            node_id: node_id.to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            success: false,
            result: None,
            error: Some(TaskError {
                code: "ENGINE_FAILURE".to_string(),
                message: "boom".to_string(),
                details: None,
                retryable: false,
                retry_after_ms: None,
                severity: ErrorSeverity::High,
            }),
            processing_time_ms: 10,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schedule_task_starts_queued_and_publishes_canonical_envelope() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker.clone(), test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["prompt".to_string()], "n1", "p1", "u1", Priority::High)
            .await
            .unwrap();

        let record = scheduler.task_status(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Queued);

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "llm.direct");
        assert_eq!(published[0].routing_key, "ai.process");
        assert_eq!(published[0].priority, 8);
        assert_eq!(published[0].correlation_id.as_deref(), Some(task_id.to_string().as_str()));
    }

    #[tokio::test]
    async fn record_result_transitions_to_completed_and_removes_record() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let task_id = scheduler
            .schedule_analyze(vec!["x".to_string()], "n1", "p1", "u1", Priority::High)
            .await
            .unwrap();

        scheduler
            .record_result(success_result(task_id, TaskType::Analyze, "n1"))
            .await
            .unwrap();

        assert!(scheduler.task_status(task_id).await.is_none());
    }

    #[tokio::test]
    async fn record_result_failure_transitions_to_failed() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["x".to_string()], "n1", "p1", "u1", Priority::Normal)
            .await
            .unwrap();

        let mut events = scheduler.subscribe();
        scheduler
            .record_result(failure_result(task_id, TaskType::Generate, "n1"))
            .await
            .unwrap();

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::TaskCompleted { success, .. } = event {
                saw_failed = !success;
            }
        }
        assert!(saw_failed);
        assert!(scheduler.task_status(task_id).await.is_none());
    }

    #[tokio::test]
    async fn task_times_out_when_no_result_arrives() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["x".to_string()], "n1", "p1", "u1", Priority::Low)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(scheduler.task_status(task_id).await.is_none());
    }

    #[tokio::test]
    async fn late_result_after_timeout_is_rejected_as_not_found() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["x".to_string()], "n1", "p1", "u1", Priority::Low)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let err = scheduler
            .record_result(success_result(task_id, TaskType::Generate, "n1"))
            .await;
        assert!(matches!(err, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_publishes_control_message_and_removes_record() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker.clone(), test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["x".to_string()], "n1", "p1", "u1", Priority::Normal)
            .await
            .unwrap();

        scheduler.cancel_task(task_id).await.unwrap();

        assert!(scheduler.task_status(task_id).await.is_none());
        let published = broker.published().await;
        let cancel_publish = published.iter().find(|p| p.routing_key == "task.cancel").unwrap();
        assert_eq!(cancel_publish.exchange, "llm.direct");
        assert_eq!(cancel_publish.correlation_id.as_deref(), Some(task_id.to_string().as_str()));
    }

    #[tokio::test]
    async fn cancel_already_terminal_task_is_rejected() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let task_id = scheduler
            .schedule_generate(vec!["x".to_string()], "n1", "p1", "u1", Priority::Normal)
            .await
            .unwrap();
        scheduler.cancel_task(task_id).await.unwrap();
        let err = scheduler.cancel_task(task_id).await;
        assert!(matches!(err, Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let err = scheduler.schedule_batch(vec![], BatchOptions::default()).await;
        assert!(matches!(err, Err(SchedulerError::EmptyBatch)));
    }

    fn sample_task(priority: Priority) -> TaskMessage {
        TaskMessage {
            task_id: Uuid::new_v4(),
            task_type: TaskType::Optimize,
            inputs: vec!["a".to_string()],
            context: None,
            instruction: None,
            node_id: "n1".to_string(),
            project_id: "p1".to_string(),
            user_id: "u1".to_string(),
            priority,
            timestamp: Utc::now(),
            temperature: None,
            retry_count: 0,
            metadata: TaskMetadata::default(),
        }
    }

    #[tokio::test]
    async fn schedule_batch_tags_every_task_with_batch_id() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker.clone(), test_defaults());
        let batch_id = scheduler
            .schedule_batch(
                vec![sample_task(Priority::Normal), sample_task(Priority::Normal)],
                BatchOptions::default(),
            )
            .await
            .unwrap();
        let active = scheduler.active_tasks().await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|r| r.batch_id == Some(batch_id)));

        let published = broker.published().await;
        assert!(published.iter().any(|p| p.routing_key == "ai.batch"));
    }

    #[tokio::test]
    async fn stats_counts_terminal_transitions_as_lifetime_totals() {
        let broker = MockBroker::new();
        let scheduler = AITaskScheduler::new(broker, test_defaults());
        let completed = scheduler
            .schedule_generate(vec!["a".to_string()], "n1", "p1", "u1", Priority::Normal)
            .await
            .unwrap();
        let cancelled = scheduler
            .schedule_generate(vec!["b".to_string()], "n1", "p1", "u1", Priority::Normal)
            .await
            .unwrap();

        scheduler
            .record_result(success_result(completed, TaskType::Generate, "n1"))
            .await
            .unwrap();
        scheduler.cancel_task(cancelled).await.unwrap();

        let stats = scheduler.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.queued, 0);
    }
}
