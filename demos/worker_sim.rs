//! Simulates an AI worker node: consumes `ai.tasks`, "processes" each task
//! with a short fixed delay, and publishes a canned success result back to
//! `ai.results`. Useful for exercising the scheduler end-to-end against a
//! real broker without a real model behind it.
//!
//! Usage: `worker-sim <node_id>`

use std::env;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use taskforge_broker::broker::{Ack, DeliveryHandler, MessageBroker, PublishOptions};
use taskforge_broker::config::CoreConfig;
use taskforge_broker::connection::ConnectionManager;
use taskforge_broker::contracts::{ProcessingMetadata, ResultMessage, ResultPayload, TaskMessage};
use taskforge_broker::topology::TopologyManager;
use taskforge_broker::{init_tracing, AmqpBroker};
use tracing::{info, warn};
use uuid::Uuid;

const TASKS_QUEUE: &str = "ai.tasks";
const RESULTS_EXCHANGE: &str = "ai.results";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let node_id = env::args().nth(1).unwrap_or_else(|| "worker-sim".to_string());

    let config = CoreConfig::load()?;
    let connection = Arc::new(ConnectionManager::new(&config.connection_url, config.retry.clone(), config.heartbeat)?);
    let topology = Arc::new(TopologyManager::new(config.topology.clone(), config.dead_letter.clone())?);
    topology.initialize(&connection.channel().await?).await?;

    let amqp_broker = AmqpBroker::new(
        connection,
        config.retry.clone(),
        config.prefetch,
        config.scheduler.confirm_timeout,
    );
    amqp_broker.connect().await?;
    let broker: Arc<dyn MessageBroker> = Arc::new(amqp_broker);

    info!(node_id, "worker-sim consuming ai.tasks");

    let handler_broker = Arc::clone(&broker);
    let handler_node_id = node_id.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let broker = Arc::clone(&handler_broker);
        let node_id = handler_node_id.clone();
        async move {
            let task = match TaskMessage::from_wire(&delivery.body) {
                Ok(task) => task,
                Err(err) => {
                    warn!(error = %err, "dropping malformed task");
                    return Ack::Reject;
                }
            };

            tokio::time::sleep(Duration::from_millis(200)).await;

            let result = ResultMessage {
                task_id: task.task_id,
                task_type: task.task_type,
                node_id: node_id.clone(),
                project_id: task.project_id.clone(),
                user_id: task.user_id.clone(),
                success: true,
                result: Some(ResultPayload {
                    content: format!("simulated output for task {}", task.task_id),
                    title: None,
                    confidence: Some(0.75),
                    tags: vec![],
                    reasoning: None,
                    alternatives: None,
                    semantic_type: None,
                    processing_metadata: ProcessingMetadata {
                        model: "worker-sim".to_string(),
                        token_count: 0,
                        temperature: task.temperature.unwrap_or(0.7),
                        processing_steps: None,
                        request_id: Uuid::new_v4(),
                        processing_time_ms: 200,
                        cost: None,
                    },
                }),
                error: None,
                processing_time_ms: 200,
                timestamp: chrono::Utc::now(),
            };

            let body = match result.to_wire() {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "failed to encode simulated result");
                    return Ack::Reject;
                }
            };

            let routing_key = format!("ai.result.{:?}", task.task_type).to_lowercase();
            if let Err(err) = broker
                .publish(
                    RESULTS_EXCHANGE,
                    &routing_key,
                    &body,
                    PublishOptions {
                        correlation_id: Some(task.task_id.to_string()),
                        message_type: Some("ai_result".to_string()),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(error = %err, "failed to publish simulated result");
                return Ack::NackRequeue;
            }

            Ack::Ack
        }
        .boxed()
    });

    broker.consume(TASKS_QUEUE, "worker-sim", handler).await?;
    Ok(())
}
