//! Domain event pub/sub, routed by category onto the topic or fanout
//! exchange and matched by AMQP topic patterns rather than client-side
//! filtering.
//!
//! Each subscriber gets its own exclusive queue via
//! [`MessageBroker::declare_transient_queue`], so deliveries fan out to every
//! matching subscriber instead of round-robining across a shared one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{Ack, BrokerError, DeliveryHandler, MessageBroker, PublishOptions};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::contracts::{ContractError, EventCategory, EventEnvelope};

/// Topic exchange backing `node.*`/`project.*`/`user.*`/`ai.*` events.
const EVENTS_TOPIC_EXCHANGE: &str = "events.topic";
/// Fanout exchange backing `system.*` events, which every subscriber should
/// see regardless of routing key.
const REALTIME_FANOUT_EXCHANGE: &str = "realtime.fanout";

fn exchange_for(category: EventCategory) -> &'static str {
    match category {
        EventCategory::System => REALTIME_FANOUT_EXCHANGE,
        _ => EVENTS_TOPIC_EXCHANGE,
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("no subscription found for handle {0}")]
    UnknownSubscription(Uuid),
}

/// Publishes domain events, namespacing routing keys by category as
/// `"{category}.{name}"` and routing system events to the realtime fanout
/// exchange instead of the topic exchange.
pub struct EventPublisher {
    broker: Arc<dyn MessageBroker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    pub async fn publish(
        &self,
        category: EventCategory,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, BusError> {
        self.publish_correlated(category, name, payload, None).await
    }

    /// Publish an event carrying a `correlation_id` linking it back to the
    /// task or request that caused it.
    pub async fn publish_correlated(
        &self,
        category: EventCategory,
        name: &str,
        payload: serde_json::Value,
        correlation_id: Option<String>,
    ) -> Result<Uuid, BusError> {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            category,
            name: name.to_string(),
            source: "taskforge-broker".to_string(),
            payload,
            timestamp: chrono::Utc::now(),
            correlation_id: correlation_id.clone(),
        };
        let body = envelope.to_wire()?;
        let routing_key = EventEnvelope::routing_key(category, name);
        self.broker
            .publish(
                exchange_for(category),
                &routing_key,
                &body,
                PublishOptions {
                    priority: category.priority(),
                    correlation_id,
                    message_type: Some("domain_event".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(envelope.event_id)
    }

    pub async fn publish_node_event(&self, name: &str, payload: serde_json::Value) -> Result<Uuid, BusError> {
        self.publish(EventCategory::Node, name, payload).await
    }

    pub async fn publish_project_event(&self, name: &str, payload: serde_json::Value) -> Result<Uuid, BusError> {
        self.publish(EventCategory::Project, name, payload).await
    }

    pub async fn publish_user_event(&self, name: &str, payload: serde_json::Value) -> Result<Uuid, BusError> {
        self.publish(EventCategory::User, name, payload).await
    }

    pub async fn publish_ai_event(&self, name: &str, payload: serde_json::Value) -> Result<Uuid, BusError> {
        self.publish(EventCategory::Ai, name, payload).await
    }

    pub async fn publish_system_event(&self, name: &str, payload: serde_json::Value) -> Result<Uuid, BusError> {
        self.publish(EventCategory::System, name, payload).await
    }
}

/// A callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(EventEnvelope) + Send + Sync>;

struct Subscription {
    category: EventCategory,
    pattern: String,
    handler: EventHandler,
    queue: String,
    task: JoinHandle<()>,
}

/// Manages per-pattern subscriptions, each backed by its own transient queue.
pub struct EventSubscriber {
    broker: Arc<dyn MessageBroker>,
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
}

impl EventSubscriber {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events of `category` whose name matches `pattern` (an
    /// AMQP topic pattern over the name portion of the routing key, e.g.
    /// `"#"` for everything or `"task.*"` for one-segment names). Declares a
    /// fresh exclusive, auto-delete queue bound to the category's exchange
    /// and spawns a consumer task over it, so - unlike a shared queue -
    /// every subscription independently receives every event it matches.
    pub async fn subscribe(
        &self,
        category: EventCategory,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<Uuid, BusError> {
        let handle = Uuid::new_v4();
        let (queue, task) = self.bind_and_spawn(handle, category, pattern, Arc::clone(&handler)).await?;

        self.subscriptions.lock().await.insert(
            handle,
            Subscription {
                category,
                pattern: pattern.to_string(),
                handler,
                queue,
                task,
            },
        );
        Ok(handle)
    }

    /// Declare a fresh transient queue bound to `category`/`pattern` and spawn
    /// a consumer task dispatching to `handler`. Shared by [`Self::subscribe`]
    /// and [`Self::resubscribe_all`] so a rebuilt subscription is declared
    /// exactly the same way as a fresh one.
    async fn bind_and_spawn(
        &self,
        handle: Uuid,
        category: EventCategory,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<(String, JoinHandle<()>), BusError> {
        let binding_pattern = if pattern.is_empty() || pattern == "#" {
            format!("{}.#", category.routing_prefix())
        } else {
            format!("{}.{}", category.routing_prefix(), pattern)
        };
        let queue = self
            .broker
            .declare_transient_queue(exchange_for(category), &binding_pattern)
            .await?;

        let broker = Arc::clone(&self.broker);
        let consumer_tag = format!("sub-{handle}");
        let consume_queue = queue.clone();

        let delivery_handler: DeliveryHandler = Arc::new(move |delivery| {
            let handler = Arc::clone(&handler);
            async move { decode_and_dispatch(&delivery.body, &handler) }.boxed()
        });

        let task = tokio::spawn(async move {
            if let Err(err) = broker.consume(&consume_queue, &consumer_tag, delivery_handler).await {
                warn!(error = %err, "event subscription ended");
            }
        });

        info!(%handle, category = category.routing_prefix(), pattern = binding_pattern, "subscribed to domain events");
        Ok((queue, task))
    }

    /// Rebuild every active subscription's transient queue and consumer task
    /// after a reconnect - exclusive, auto-delete queues don't survive the
    /// channel they were declared on, so each must be redeclared and rebound
    /// rather than merely re-consumed. Existing handles keep working.
    pub async fn resubscribe_all(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        let handles: Vec<Uuid> = subscriptions.keys().copied().collect();
        for handle in handles {
            let (category, pattern, handler) = {
                let existing = subscriptions.get(&handle).expect("handle from own key set");
                (existing.category, existing.pattern.clone(), Arc::clone(&existing.handler))
            };
            match self.bind_and_spawn(handle, category, &pattern, Arc::clone(&handler)).await {
                Ok((queue, task)) => {
                    if let Some(previous) = subscriptions.insert(
                        handle,
                        Subscription {
                            category,
                            pattern,
                            handler,
                            queue,
                            task,
                        },
                    ) {
                        previous.task.abort();
                    }
                }
                Err(err) => warn!(%handle, error = %err, "failed to rebuild event subscription after reconnect"),
            }
        }
    }

    /// Listen for [`ConnectionEvent::Reconnected`] and rebuild every
    /// subscription each time it fires. Runs until the connection's event
    /// channel closes; spawn alongside the rest of a service's supervisors.
    pub async fn run_reconnect_supervisor(&self, connection: Arc<ConnectionManager>) {
        let mut events = connection.subscribe();
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Reconnected { attempt }) => {
                    info!(attempt, "reconnected, rebuilding event subscriptions");
                    self.resubscribe_all().await;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Subscribe to every event in `category`, equivalent to `subscribe(category, "#", handler)`.
    pub async fn subscribe_all(&self, category: EventCategory, handler: EventHandler) -> Result<Uuid, BusError> {
        self.subscribe(category, "#", handler).await
    }

    pub async fn unsubscribe(&self, handle: Uuid) -> Result<(), BusError> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(&handle)
            .ok_or(BusError::UnknownSubscription(handle))?;
        subscription.task.abort();
        self.broker.delete_queue(&subscription.queue).await?;
        Ok(())
    }

    pub async fn unsubscribe_all(&self) {
        let mut subscriptions = self.subscriptions.lock().await;
        for (_, subscription) in subscriptions.drain() {
            subscription.task.abort();
            let _ = self.broker.delete_queue(&subscription.queue).await;
        }
    }

    pub async fn active_subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

/// Decode one delivery and invoke `handler`. Matching already happened at
/// the broker via the subscription's queue binding, so unlike the old
/// client-side filter, every delivery that reaches here is dispatched.
/// Malformed payloads are rejected without requeue.
fn decode_and_dispatch(body: &[u8], handler: &EventHandler) -> Ack {
    match EventEnvelope::from_wire(body) {
        Ok(envelope) => {
            handler(envelope);
            Ack::Ack
        }
        Err(err) => {
            warn!(error = %err, "dropping malformed event envelope");
            Ack::Reject
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn publish_namespaces_routing_key_by_category() {
        let broker = MockBroker::new();
        let publisher = EventPublisher::new(broker.clone());
        publisher
            .publish_ai_event("task.completed", serde_json::json!({"task_id": "abc"}))
            .await
            .unwrap();
        let published = broker.published().await;
        assert_eq!(published[0].routing_key, "ai.task.completed");
        assert_eq!(published[0].exchange, "events.topic");
    }

    #[tokio::test]
    async fn system_events_route_to_realtime_fanout() {
        let broker = MockBroker::new();
        let publisher = EventPublisher::new(broker.clone());
        publisher
            .publish_system_event("heartbeat", serde_json::json!({}))
            .await
            .unwrap();
        let published = broker.published().await;
        assert_eq!(published[0].exchange, "realtime.fanout");
        assert_eq!(published[0].priority, 8);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_handle_errors() {
        let broker = MockBroker::new();
        let subscriber = EventSubscriber::new(broker);
        let err = subscriber.unsubscribe(Uuid::new_v4()).await;
        assert!(matches!(err, Err(BusError::UnknownSubscription(_))));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_all_clears_count() {
        let broker = MockBroker::new();
        let subscriber = EventSubscriber::new(broker);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        subscriber
            .subscribe_all(
                EventCategory::System,
                Arc::new(move |_| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        assert_eq!(subscriber.active_subscription_count().await, 1);
        subscriber.unsubscribe_all().await;
        assert_eq!(subscriber.active_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn dispatch_rejects_malformed_payload() {
        let handler: EventHandler = Arc::new(|_| {});
        let disposition = decode_and_dispatch(b"not json", &handler);
        assert_eq!(disposition, Ack::Reject);
    }

    #[tokio::test]
    async fn subscriber_receives_only_matching_pattern() {
        let broker = MockBroker::new();
        let publisher = EventPublisher::new(broker.clone());
        let subscriber = EventSubscriber::new(broker.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        subscriber
            .subscribe(
                EventCategory::Node,
                "created",
                Arc::new(move |envelope| {
                    let received = Arc::clone(&received_clone);
                    tokio::spawn(async move {
                        received.lock().await.push(envelope.name);
                    });
                }),
            )
            .await
            .unwrap();

        publisher
            .publish_node_event("created", serde_json::json!({}))
            .await
            .unwrap();
        publisher
            .publish_node_event("deleted", serde_json::json!({}))
            .await
            .unwrap();
        publisher
            .publish_project_event("created", serde_json::json!({}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().await.as_slice(), ["created"]);
    }

    #[tokio::test]
    async fn unsubscribe_deletes_the_backing_queue() {
        let broker = MockBroker::new();
        let subscriber = EventSubscriber::new(broker.clone());
        let handle = subscriber
            .subscribe_all(EventCategory::Ai, Arc::new(|_| {}))
            .await
            .unwrap();
        subscriber.unsubscribe(handle).await.unwrap();

        let publisher = EventPublisher::new(broker);
        publisher
            .publish_ai_event("noop", serde_json::json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resubscribe_all_keeps_handle_and_rebuilds_queue() {
        let broker = MockBroker::new();
        let publisher = EventPublisher::new(broker.clone());
        let subscriber = EventSubscriber::new(broker.clone());

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let handle = subscriber
            .subscribe_all(
                EventCategory::Ai,
                Arc::new(move |_| {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let original_queue = subscriber.subscriptions.lock().await.get(&handle).unwrap().queue.clone();

        subscriber.resubscribe_all().await;
        assert_eq!(subscriber.active_subscription_count().await, 1);
        let rebuilt_queue = subscriber.subscriptions.lock().await.get(&handle).unwrap().queue.clone();
        assert_ne!(original_queue, rebuilt_queue);

        publisher.publish_ai_event("rebuilt", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
