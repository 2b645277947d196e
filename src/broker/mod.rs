//! The publish/consume/RPC surface on top of a declared topology.
//!
//! Publishes retry with backoff around a single publish-and-wait-for-confirm;
//! consumers reconnect and resubscribe on a dropped channel. Exchange and
//! routing key are arbitrary per call, and an RPC path (temporary reply
//! queue keyed by correlation id) and transient-queue management round out
//! the surface beyond plain publish/consume.

pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::connection::ConnectionManager;

/// Envelope headers applied to a publish: delivery mode, priority,
/// correlation/reply-to/message identifiers, and the logical message
/// `type_` and `user_id`. `app_id` defaults to `"broker"` the way the rest
/// of this workspace's services tag their own publishes.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub persistent: bool,
    pub priority: u8,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub expiration: Option<Duration>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: String,
    pub mandatory: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            priority: 0,
            correlation_id: None,
            reply_to: None,
            message_id: None,
            expiration: None,
            message_type: None,
            user_id: None,
            app_id: "broker".to_string(),
            mandatory: true,
        }
    }
}

impl PublishOptions {
    fn into_properties(self) -> BasicProperties {
        let mut props = BasicProperties::default()
            .with_delivery_mode(if self.persistent { 2 } else { 1 })
            .with_priority(self.priority)
            .with_correlation_id(
                self.correlation_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string())
                    .into(),
            )
            .with_message_id(
                self.message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string())
                    .into(),
            )
            .with_timestamp(chrono::Utc::now().timestamp_millis() as u64)
            .with_app_id(self.app_id.into());
        if let Some(reply_to) = self.reply_to {
            props = props.with_reply_to(reply_to.into());
        }
        if let Some(expiration) = self.expiration {
            props = props.with_expiration(expiration.as_millis().to_string().into());
        }
        if let Some(message_type) = self.message_type {
            props = props.with_kind(message_type.into());
        }
        if let Some(user_id) = self.user_id {
            props = props.with_user_id(user_id.into());
        }
        props
    }
}

/// Match a routing key against a topic pattern using AMQP's `*`
/// (exactly one segment) and `#` (zero or more segments) wildcards.
/// Used by [`mock::MockBroker`] to simulate broker-side topic routing,
/// since a real `lapin::Channel` already does this matching server-side.
pub fn topic_pattern_matches(pattern: &str, routing_key: &str) -> bool {
    // A fanout binding conventionally carries an empty routing key and
    // ignores the published routing key entirely (a real fanout exchange
    // never consults it), so treat `""` as "match anything".
    if pattern.is_empty() {
        return true;
    }
    let pattern_segs: Vec<&str> = pattern.split('.').collect();
    let key_segs: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_segments(&pattern_segs, &key_segs)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=key.len()).any(|i| matches_segments(&pattern[1..], &key[i..]))
        }
        Some(&"*") => !key.is_empty() && matches_segments(&pattern[1..], &key[1..]),
        Some(seg) => key.first().map(|k| k == seg).unwrap_or(false) && matches_segments(&pattern[1..], &key[1..]),
    }
}

/// Errors surfaced by publish, consume, RPC, and queue-management operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("publish was not confirmed by the broker")]
    NotConfirmed,

    #[error("message was returned undeliverable (mandatory publish, no matching queue)")]
    Returned,

    #[error("publish confirm for '{routing_key}' timed out after {timeout:?}")]
    ConfirmTimeout {
        routing_key: String,
        timeout: Duration,
    },

    #[error("rpc call to '{routing_key}' timed out after {timeout:?}")]
    RpcTimeout {
        routing_key: String,
        timeout: Duration,
    },

    #[error("broker is not ready")]
    NotReady,
}

/// Broadcast when the broker returns a mandatory-but-unroutable publish,
/// per the "Returned messages" contract - informational, not itself an
/// error the publisher needs to act on beyond what `publish` already
/// reports via [`BrokerError::Returned`].
#[derive(Debug, Clone)]
pub struct ReturnedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
}

/// A message delivered to a consumer, carrying what's needed to ack/nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
}

/// Disposition a consumer callback returns for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    /// Reject and requeue (transient failure).
    NackRequeue,
    /// Reject without requeue, routing to the dead-letter exchange if bound
    /// (malformed payload, permanent failure).
    Reject,
}

/// A delivery callback, boxed so it can cross the `MessageBroker` trait
/// object boundary. Returns the disposition the consumer loop should apply.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> futures::future::BoxFuture<'static, Ack> + Send + Sync>;

/// Publish/consume/RPC operations against a declared topology.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    async fn publish_rpc(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError>;

    /// Consume `queue` until the delivery stream ends, dispatching each
    /// delivery to `handler`. Runs until the channel closes; callers that
    /// want a long-lived subscription spawn this on its own task.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64, disposition: Ack) -> Result<(), BrokerError>;

    async fn queue_message_count(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Declare a non-durable, auto-delete, exclusive queue bound to
    /// `exchange` under `pattern`, returning its generated name. Used by
    /// [`crate::events::EventSubscriber`] for pattern-based subscriptions
    /// and by RPC reply queues.
    async fn declare_transient_queue(&self, exchange: &str, pattern: &str) -> Result<String, BrokerError>;

    fn is_ready(&self) -> bool;
}

/// Real AMQP-backed broker, built on a [`ConnectionManager`].
///
/// Publish confirmations are tracked per-call via the `PublisherConfirm`
/// future `lapin` returns from `basic_publish`, which is itself keyed
/// internally by the server-assigned delivery tag - so two in-flight
/// publishes on the same channel resolve independently and can never be
/// confused with one another.
///
/// Keeps two channels: a normal channel for consumption and non-publish
/// queue operations, and a confirm channel (confirm-select applied once, on
/// first use) that every publish goes through. `is_ready()` only reports
/// ready once both exist and are connected.
///
/// Each publish waits for its confirm under `confirm_timeout`, failing with
/// [`BrokerError::ConfirmTimeout`] rather than hanging forever if the broker
/// never acks. A return (mandatory publish, no matching queue) is detected
/// before the ack/nack check and reported both as [`BrokerError::Returned`]
/// and on the `returns` broadcast channel ([`AmqpBroker::subscribe_returns`]).
pub struct AmqpBroker {
    connection: Arc<ConnectionManager>,
    retry: RetryPolicy,
    prefetch: u16,
    confirm_timeout: Duration,
    normal_channel: Mutex<Option<Channel>>,
    confirm_channel: Mutex<Option<Channel>>,
    returns: broadcast::Sender<ReturnedMessage>,
}

impl AmqpBroker {
    pub fn new(
        connection: Arc<ConnectionManager>,
        retry: RetryPolicy,
        prefetch: u16,
        confirm_timeout: Duration,
    ) -> Self {
        let (returns, _) = broadcast::channel(64);
        Self {
            connection,
            retry,
            prefetch,
            confirm_timeout,
            normal_channel: Mutex::new(None),
            confirm_channel: Mutex::new(None),
            returns,
        }
    }

    /// Subscribe to mandatory-but-unroutable publish returns.
    pub fn subscribe_returns(&self) -> broadcast::Receiver<ReturnedMessage> {
        self.returns.subscribe()
    }

    /// Eagerly establish both channels so `is_ready()` reports true without
    /// waiting for a first publish or consume. Callers that want the
    /// Scheduler's consumer-setup retry loop (`run_result_consumer_with_retry`)
    /// to succeed promptly should call this right after construction.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.channel().await?;
        self.confirm_channel().await?;
        Ok(())
    }

    /// The normal channel: consumption and non-publish queue operations.
    async fn channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.normal_channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let channel = self.connection.channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// The confirm channel: every publish goes through this one, in
    /// confirm-select mode, so the caller gets an ack/nack per message.
    async fn confirm_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.confirm_channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }
        let channel = self.connection.channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn setup_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<lapin::Consumer, BrokerError> {
        let channel = self.channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, consumer_tag, "consumer registered");
        Ok(consumer)
    }

    fn process_delivery(&self, delivery: &lapin::message::Delivery) -> Delivery {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.to_string(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|c| c.to_string()),
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|r| r.to_string()),
            body: delivery.data.clone(),
        }
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let channel = self.confirm_channel().await?;
        let mandatory = options.mandatory;
        let properties = options.into_properties();
        let confirm_timeout = self.confirm_timeout;
        let returns = self.returns.clone();
        let attempt = || {
            let channel = channel.clone();
            let body = body.to_vec();
            let properties = properties.clone();
            let returns = returns.clone();
            async move {
                let correlation_id = properties.correlation_id().as_ref().map(|c| c.to_string());
                let publisher_confirm = channel
                    .basic_publish(
                        exchange,
                        routing_key,
                        BasicPublishOptions {
                            mandatory,
                            ..Default::default()
                        },
                        &body,
                        properties,
                    )
                    .await?;

                let mut confirm = match tokio::time::timeout(confirm_timeout, publisher_confirm).await {
                    Ok(confirm) => confirm?,
                    Err(_) => {
                        return Err(BrokerError::ConfirmTimeout {
                            routing_key: routing_key.to_string(),
                            timeout: confirm_timeout,
                        })
                    }
                };

                if confirm.take_message().is_some() {
                    let _ = returns.send(ReturnedMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        correlation_id,
                    });
                    warn!(exchange, routing_key, "message returned undeliverable (mandatory publish, no matching queue)");
                    return Err(BrokerError::Returned);
                }

                if confirm.is_ack() {
                    Ok::<_, BrokerError>(())
                } else {
                    Err(BrokerError::NotConfirmed)
                }
            }
        };

        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.retry.initial_delay)
                    .with_max_delay(self.retry.max_delay)
                    .with_factor(self.retry.backoff_multiplier as f32)
                    .with_max_times(self.retry.max_retries as usize),
            )
            .notify(|err: &BrokerError, dur| {
                warn!(error = %err, retry_in = ?dur, "retrying publish");
            })
            .await
    }

    async fn publish_rpc(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, BrokerError> {
        let channel = self.channel().await?;
        let correlation_id = Uuid::new_v4().to_string();
        let reply_queue = channel
            .queue_declare(
                "",
                lapin::options::QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue_name = reply_queue.name().to_string();

        let mut reply_consumer = channel
            .basic_consume(
                &reply_queue_name,
                &format!("rpc-reply-{correlation_id}"),
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let properties = BasicProperties::default()
            .with_correlation_id(correlation_id.clone().into())
            .with_reply_to(reply_queue_name.into());

        let confirm_channel = self.confirm_channel().await?;
        confirm_channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;

        let wait_for_reply = async {
            while let Some(delivery) = reply_consumer.next().await {
                let delivery = delivery?;
                let matches = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|c| c.as_str() == correlation_id)
                    .unwrap_or(false);
                if matches {
                    return Ok::<_, BrokerError>(delivery.data.clone());
                }
            }
            Err(BrokerError::NotConfirmed)
        };

        match tokio::time::timeout(timeout, wait_for_reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BrokerError::RpcTimeout {
                routing_key: routing_key.to_string(),
                timeout,
            }),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        handler: DeliveryHandler,
    ) -> Result<(), BrokerError> {
        let setup = || async { self.setup_consumer(queue, consumer_tag).await };

        let mut consumer = setup
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(self.retry.initial_delay)
                    .with_max_delay(self.retry.max_delay)
                    .with_factor(self.retry.backoff_multiplier as f32)
                    .with_max_times(self.retry.max_retries as usize),
            )
            .notify(|err: &BrokerError, dur| {
                warn!(error = %err, retry_in = ?dur, "retrying consumer setup");
            })
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(err) => {
                    warn!(error = %err, "consumer stream error, will reconnect");
                    break;
                }
            };

            let parsed = self.process_delivery(&delivery);
            let disposition = handler(parsed).await;
            let tag = delivery.delivery_tag;
            let result = match disposition {
                Ack::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
                Ack::NackRequeue => {
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                }
                Ack::Reject => {
                    delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                }
            };
            if let Err(err) = result {
                warn!(error = %err, delivery_tag = tag, "failed to settle delivery");
            }
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, disposition: Ack) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        match disposition {
            Ack::Ack => channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?,
            Ack::NackRequeue => {
                channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await?
            }
            Ack::Reject => {
                channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
                    .await?
            }
        }
        Ok(())
    }

    async fn queue_message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let channel = self.channel().await?;
        let info = channel
            .queue_declare(
                queue,
                lapin::options::QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(info.message_count())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let channel = self.channel().await?;
        let purged = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
        Ok(purged)
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        let channel = self.channel().await?;
        let deleted = channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(deleted)
    }

    async fn declare_transient_queue(&self, exchange: &str, pattern: &str) -> Result<String, BrokerError> {
        let channel = self.channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let name = queue.name().to_string();
        channel
            .queue_bind(
                &name,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(name)
    }

    fn is_ready(&self) -> bool {
        if !self.connection.is_ready() {
            return false;
        }
        let normal_up = self
            .normal_channel
            .try_lock()
            .map(|guard| guard.as_ref().map(|c| c.status().connected()).unwrap_or(false))
            .unwrap_or(false);
        let confirm_up = self
            .confirm_channel
            .try_lock()
            .map(|guard| guard.as_ref().map(|c| c.status().connected()).unwrap_or(false))
            .unwrap_or(false);
        normal_up && confirm_up
    }
}
