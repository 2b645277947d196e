//! In-memory [`MessageBroker`] double for tests that don't need a live
//! RabbitMQ instance.
//!
//! Records every publish in a `Vec` behind a mutex so tests can assert on
//! what went out, and simulates broker-side topic routing for transient
//! queues so pattern-bound subscriptions can be exercised without a live
//! RabbitMQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Ack, BrokerError, Delivery, DeliveryHandler, MessageBroker, PublishOptions};

/// A single recorded publish, for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub priority: u8,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

/// A queue binding: which exchange/pattern a queue listens on, set either
/// by [`MockBroker::declare_transient_queue`] or by a test via
/// [`MockBroker::bind_queue`] to simulate the static topology.
#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    pattern: String,
}

/// Records every publish and lets a test script canned RPC responses,
/// per-queue depths, and topic-pattern bindings ahead of time.
#[derive(Default)]
pub struct MockBroker {
    published: Mutex<Vec<RecordedPublish>>,
    rpc_responses: Mutex<HashMap<String, Vec<u8>>>,
    queue_depths: Mutex<HashMap<String, u32>>,
    settled: Mutex<Vec<(u64, Ack)>>,
    queued_deliveries: Mutex<HashMap<String, Vec<Delivery>>>,
    bindings: Mutex<HashMap<String, Binding>>,
    consumers: Mutex<HashMap<String, DeliveryHandler>>,
    next_delivery_tag: AtomicU64,
    ready: std::sync::atomic::AtomicBool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        let broker = Self::default();
        broker.ready.store(true, Ordering::SeqCst);
        Arc::new(broker)
    }

    pub async fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().await.clone()
    }

    pub async fn settled(&self) -> Vec<(u64, Ack)> {
        self.settled.lock().await.clone()
    }

    /// Pre-program the reply `publish_rpc` returns for calls on `routing_key`.
    pub async fn stub_rpc_response(&self, routing_key: &str, body: Vec<u8>) {
        self.rpc_responses
            .lock()
            .await
            .insert(routing_key.to_string(), body);
    }

    pub async fn set_queue_depth(&self, queue: &str, depth: u32) {
        self.queue_depths.lock().await.insert(queue.to_string(), depth);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Bind `queue` to `exchange`/`pattern`, the way [`crate::topology::TopologyManager`]
    /// would against a real channel. Used by tests that exercise a fixed,
    /// named queue rather than a dynamically declared transient one.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        self.bindings.lock().await.insert(
            queue.to_string(),
            Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            },
        );
    }

    /// Enqueue a delivery that the next matching [`MockBroker::consume`] call
    /// will hand to its handler.
    pub async fn enqueue_delivery(&self, queue: &str, delivery: Delivery) {
        self.queued_deliveries
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(delivery);
    }

    fn next_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::SeqCst)
    }

    /// Route a published body to every queue bound to `exchange` under a
    /// matching pattern: if a consumer is already registered for that
    /// queue, invoke its handler immediately (simulating at-least-once
    /// delivery); otherwise park the delivery for a later `consume` call.
    async fn route(&self, exchange: &str, routing_key: &str, body: &[u8], options: &PublishOptions) {
        let matches: Vec<String> = self
            .bindings
            .lock()
            .await
            .iter()
            .filter(|(_, binding)| {
                binding.exchange == exchange && super::topic_pattern_matches(&binding.pattern, routing_key)
            })
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in matches {
            let delivery = Delivery {
                delivery_tag: self.next_tag(),
                routing_key: routing_key.to_string(),
                correlation_id: options.correlation_id.clone(),
                reply_to: options.reply_to.clone(),
                body: body.to_vec(),
            };
            let handler = self.consumers.lock().await.get(&queue).cloned();
            match handler {
                Some(handler) => {
                    let tag = delivery.delivery_tag;
                    let disposition = handler(delivery).await;
                    self.settled.lock().await.push((tag, disposition));
                }
                None => {
                    self.queued_deliveries
                        .lock()
                        .await
                        .entry(queue)
                        .or_default()
                        .push(delivery);
                }
            }
        }
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if !self.is_ready() {
            return Err(BrokerError::NotReady);
        }
        self.published.lock().await.push(RecordedPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            priority: options.priority,
            correlation_id: options.correlation_id.clone(),
            persistent: options.persistent,
        });
        self.route(exchange, routing_key, body, &options).await;
        Ok(())
    }

    async fn publish_rpc(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        self.publish(exchange, routing_key, body, PublishOptions::default()).await?;
        match self.rpc_responses.lock().await.remove(routing_key) {
            Some(reply) => Ok(reply),
            None => Err(BrokerError::RpcTimeout {
                routing_key: routing_key.to_string(),
                timeout,
            }),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), BrokerError> {
        self.consumers
            .lock()
            .await
            .insert(queue.to_string(), Arc::clone(&handler));

        let drained = self
            .queued_deliveries
            .lock()
            .await
            .remove(queue)
            .unwrap_or_default();
        for delivery in drained {
            let tag = delivery.delivery_tag;
            let disposition = handler(delivery).await;
            self.settled.lock().await.push((tag, disposition));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, disposition: Ack) -> Result<(), BrokerError> {
        self.settled.lock().await.push((delivery_tag, disposition));
        Ok(())
    }

    async fn queue_message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        Ok(self
            .queue_depths
            .lock()
            .await
            .get(queue)
            .copied()
            .unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let mut depths = self.queue_depths.lock().await;
        Ok(depths.insert(queue.to_string(), 0).unwrap_or(0))
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.bindings.lock().await.remove(queue);
        self.consumers.lock().await.remove(queue);
        let mut depths = self.queue_depths.lock().await;
        Ok(depths.remove(queue).unwrap_or(0))
    }

    async fn declare_transient_queue(&self, exchange: &str, pattern: &str) -> Result<String, BrokerError> {
        let name = format!("temp.{}", Uuid::new_v4());
        self.bindings.lock().await.insert(
            name.clone(),
            Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            },
        );
        Ok(name)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_recorded() {
        let broker = MockBroker::new();
        broker
            .publish("llm.direct", "ai.process", b"hello", PublishOptions::default())
            .await
            .unwrap();
        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "ai.process");
        assert!(published[0].persistent);
    }

    #[tokio::test]
    async fn publish_records_priority_and_correlation_id() {
        let broker = MockBroker::new();
        let options = PublishOptions {
            priority: 8,
            correlation_id: Some("task-1".to_string()),
            ..Default::default()
        };
        broker.publish("llm.direct", "ai.process", b"hi", options).await.unwrap();
        let published = broker.published().await;
        assert_eq!(published[0].priority, 8);
        assert_eq!(published[0].correlation_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn publish_rejected_when_not_ready() {
        let broker = MockBroker::new();
        broker.set_ready(false);
        let err = broker
            .publish("llm.direct", "ai.process", b"hello", PublishOptions::default())
            .await;
        assert!(matches!(err, Err(BrokerError::NotReady)));
    }

    #[tokio::test]
    async fn rpc_returns_stubbed_response() {
        let broker = MockBroker::new();
        broker.stub_rpc_response("health.check", b"ok".to_vec()).await;
        let reply = broker
            .publish_rpc("", "health.check", b"ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ok");
    }

    #[tokio::test]
    async fn rpc_without_stub_times_out() {
        let broker = MockBroker::new();
        let err = broker
            .publish_rpc("", "unstubbed", b"ping", Duration::from_millis(10))
            .await;
        assert!(matches!(err, Err(BrokerError::RpcTimeout { .. })));
    }

    #[tokio::test]
    async fn transient_queue_receives_matching_publish() {
        let broker = MockBroker::new();
        let queue = broker.declare_transient_queue("events.topic", "node.*").await.unwrap();

        let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let handler: DeliveryHandler = Arc::new(move |delivery| {
            let received = Arc::clone(&received_clone);
            async move {
                received.lock().await.push(delivery.routing_key);
                Ack::Ack
            }
            .boxed()
        });
        broker.consume(&queue, "sub-1", handler).await.unwrap();

        broker
            .publish("events.topic", "node.created", b"{}", PublishOptions::default())
            .await
            .unwrap();
        broker
            .publish("events.topic", "project.created", b"{}", PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(received.lock().await.as_slice(), ["node.created"]);
    }

    #[tokio::test]
    async fn delete_queue_stops_routing_to_it() {
        let broker = MockBroker::new();
        let queue = broker.declare_transient_queue("events.topic", "#").await.unwrap();
        broker.delete_queue(&queue).await.unwrap();

        broker
            .publish("events.topic", "node.created", b"{}", PublishOptions::default())
            .await
            .unwrap();
        assert!(broker.queued_deliveries.lock().await.get(&queue).is_none());
    }
}
