//! Declares and validates the exchange/queue/binding graph against a live
//! AMQP channel, including the dead-letter exchange.
//!
//! Declaration is idempotent and driven entirely by an arbitrary
//! [`TopologyDescriptor`] rather than a hardcoded exchange list.

use std::collections::HashSet;
use std::sync::Arc;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind as LapinExchangeKind};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{DeadLetterPolicy, ExchangeKind, TopologyDescriptor};

/// Errors raised while declaring or validating topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid topology: {0}")]
    Invalid(#[from] crate::config::topology::TopologyValidationError),

    #[error("amqp error while declaring topology: {0}")]
    Amqp(#[from] lapin::Error),
}

fn to_lapin_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
    }
}

/// Declares exchanges, queues, and bindings against a channel, idempotently.
///
/// Declaration is idempotent at the AMQP level (redeclaring an identical
/// exchange/queue is a no-op), but `initialize` additionally tracks what it
/// has already declared on this manager instance so repeated calls from
/// multiple reconnect cycles don't redo unnecessary round-trips.
pub struct TopologyManager {
    descriptor: TopologyDescriptor,
    dead_letter: DeadLetterPolicy,
    declared_exchanges: Mutex<HashSet<String>>,
    declared_queues: Mutex<HashSet<String>>,
}

impl TopologyManager {
    pub fn new(descriptor: TopologyDescriptor, dead_letter: DeadLetterPolicy) -> Result<Self, TopologyError> {
        descriptor.validate()?;
        Ok(Self {
            descriptor,
            dead_letter,
            declared_exchanges: Mutex::new(HashSet::new()),
            declared_queues: Mutex::new(HashSet::new()),
        })
    }

    /// Declare every exchange and queue in the descriptor, bind queues, and
    /// declare the dead-letter exchange/queue if enabled. Safe to call again
    /// after a reconnect.
    pub async fn initialize(self: &Arc<Self>, channel: &Channel) -> Result<(), TopologyError> {
        if self.dead_letter.enabled {
            self.declare_dlx(channel).await?;
        }

        for exchange in &self.descriptor.exchanges {
            self.declare_exchange(channel, &exchange.name, exchange.kind, exchange.durable, exchange.auto_delete)
                .await?;
        }

        for queue in &self.descriptor.queues {
            let mut args = FieldTable::default();
            let dlx_name = queue
                .dead_letter_exchange
                .clone()
                .filter(|_| self.dead_letter.enabled)
                .or_else(|| self.dead_letter.enabled.then(|| self.dead_letter.exchange.clone()));
            if let Some(dlx) = dlx_name {
                args.insert("x-dead-letter-exchange".into(), dlx.into());
                args.insert(
                    "x-dead-letter-routing-key".into(),
                    self.dead_letter.routing_key.clone().into(),
                );
            }
            if let Some(max_length) = queue.max_length {
                args.insert("x-max-length".into(), (max_length as i64).into());
            }
            if let Some(max_priority) = queue.max_priority {
                args.insert("x-max-priority".into(), (max_priority as i64).into());
            }
            if let Some(ttl) = queue.message_ttl {
                args.insert("x-message-ttl".into(), (ttl.as_millis() as i64).into());
            }

            channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        ..Default::default()
                    },
                    args,
                )
                .await?;
            self.declared_queues.lock().await.insert(queue.name.clone());
            debug!(queue = %queue.name, "declared queue");

            for (exchange, routing_key) in &queue.bindings {
                channel
                    .queue_bind(
                        &queue.name,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                debug!(queue = %queue.name, exchange, routing_key, "bound queue");
            }
        }

        info!(
            exchanges = self.descriptor.exchanges.len(),
            queues = self.descriptor.queues.len(),
            "topology initialized"
        );
        Ok(())
    }

    /// Declare the dead-letter exchange and its backing queue. Called
    /// automatically by [`Self::initialize`] when dead-lettering is enabled,
    /// but also exposed directly so callers can set up the DLX ahead of the
    /// rest of the topology. The DLX is `direct` and durable, and its queue
    /// is named `<dlx-name>.dlq`.
    pub async fn declare_dlx(&self, channel: &Channel) -> Result<(), TopologyError> {
        self.declare_exchange(channel, &self.dead_letter.exchange, ExchangeKind::Direct, true, false)
            .await?;

        let dlq_name = format!("{}.dlq", self.dead_letter.exchange);
        let mut args = FieldTable::default();
        if let Some(ttl) = self.dead_letter.ttl {
            args.insert("x-message-ttl".into(), (ttl.as_millis() as i64).into());
        }
        channel
            .queue_declare(
                &dlq_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                &dlq_name,
                &self.dead_letter.exchange,
                &self.dead_letter.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.declared_queues.lock().await.insert(dlq_name);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: &Channel,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TopologyError> {
        channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.declared_exchanges.lock().await.insert(name.to_string());
        Ok(())
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }
}
