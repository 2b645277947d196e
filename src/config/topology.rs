//! Static topology descriptors: exchanges, queues, bindings.
//!
//! These types describe the shape of the broker's exchange/queue graph. The
//! actual declaration against a live channel happens in
//! [`crate::topology::TopologyManager`]; this module only carries the data.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// AMQP exchange kind, restricted to the ones this system actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(s)
    }
}

/// A single exchange to be declared.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDescriptor {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }
}

/// A single queue to be declared, bound to zero or more exchanges.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `(exchange_name, routing_key)` bindings, checked against the
    /// descriptor's own exchange list at validation time.
    pub bindings: Vec<(String, String)>,
    /// When set, overrides the topology-wide dead-letter exchange for this
    /// queue specifically.
    pub dead_letter_exchange: Option<String>,
    /// `x-max-length`: queue capacity, must be > 0 when set.
    pub max_length: Option<u32>,
    /// `x-max-priority`: highest priority value this queue ranks on,
    /// must be in `[1, 255]` when set.
    pub max_priority: Option<u8>,
    /// `x-message-ttl`, applied per-message rather than only to the DLQ.
    pub message_ttl: Option<Duration>,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            bindings: Vec::new(),
            dead_letter_exchange: None,
            max_length: None,
            max_priority: None,
            message_ttl: None,
        }
    }

    pub fn bound_to(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.bindings.push((exchange.into(), routing_key.into()));
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Error returned when a [`TopologyDescriptor`] is internally inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum TopologyValidationError {
    #[error("queue '{queue}' is bound to unknown exchange '{exchange}'")]
    UnknownExchange { queue: String, exchange: String },

    #[error("duplicate exchange name '{0}'")]
    DuplicateExchange(String),

    #[error("duplicate queue name '{0}'")]
    DuplicateQueue(String),

    #[error("queue '{0}' has max_length = 0, must be > 0")]
    InvalidMaxLength(String),

    #[error("queue '{queue}' has max_priority {value}, must be in [1, 255]")]
    InvalidMaxPriority { queue: String, value: u16 },
}

/// The full set of exchanges and queues this system declares at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyDescriptor {
    pub exchanges: Vec<ExchangeDescriptor>,
    pub queues: Vec<QueueDescriptor>,
}

impl TopologyDescriptor {
    /// The canonical exchange/queue layout: `llm.direct` for task dispatch,
    /// `ai.results` (topic) for the results fan-in, `events.topic` for
    /// domain events, and `realtime.fanout` for process-wide broadcasts.
    pub fn canonical() -> Self {
        Self {
            exchanges: vec![
                ExchangeDescriptor::new("llm.direct", ExchangeKind::Direct),
                ExchangeDescriptor::new("ai.results", ExchangeKind::Topic),
                ExchangeDescriptor::new("events.topic", ExchangeKind::Topic),
                ExchangeDescriptor::new("realtime.fanout", ExchangeKind::Fanout),
            ],
            queues: vec![
                QueueDescriptor::new("ai.tasks")
                    .bound_to("llm.direct", "ai.process")
                    .bound_to("llm.direct", "ai.batch")
                    .bound_to("llm.direct", "task.cancel")
                    .with_max_priority(10),
                QueueDescriptor::new("ai.results").bound_to("ai.results", "ai.result.#"),
                QueueDescriptor::new("events.websocket").bound_to("events.topic", "#"),
                QueueDescriptor::new("events.storage").bound_to("events.topic", "#"),
                QueueDescriptor::new("realtime.broadcast").bound_to("realtime.fanout", ""),
            ],
        }
    }

    /// Check that every queue binding references a declared exchange, that
    /// exchange/queue names are unique, and that queue arguments
    /// (max-length, max-priority, message-ttl) are non-zero where set.
    pub fn validate(&self) -> Result<(), TopologyValidationError> {
        let mut seen_exchanges = std::collections::HashSet::new();
        for exchange in &self.exchanges {
            if !seen_exchanges.insert(exchange.name.as_str()) {
                return Err(TopologyValidationError::DuplicateExchange(
                    exchange.name.clone(),
                ));
            }
        }

        let mut seen_queues = std::collections::HashSet::new();
        for queue in &self.queues {
            if !seen_queues.insert(queue.name.as_str()) {
                return Err(TopologyValidationError::DuplicateQueue(queue.name.clone()));
            }
            for (exchange, _routing_key) in &queue.bindings {
                if !seen_exchanges.contains(exchange.as_str()) {
                    return Err(TopologyValidationError::UnknownExchange {
                        queue: queue.name.clone(),
                        exchange: exchange.clone(),
                    });
                }
            }
            if let Some(0) = queue.max_length {
                return Err(TopologyValidationError::InvalidMaxLength(queue.name.clone()));
            }
            if let Some(max_priority) = queue.max_priority {
                if !(1..=255).contains(&max_priority) {
                    return Err(TopologyValidationError::InvalidMaxPriority {
                        queue: queue.name.clone(),
                        value: max_priority as u16,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_topology_is_valid() {
        TopologyDescriptor::canonical().validate().unwrap();
    }

    #[test]
    fn unbound_exchange_reference_is_rejected() {
        let mut topology = TopologyDescriptor::canonical();
        topology.queues.push(QueueDescriptor::new("orphan").bound_to("nonexistent", "x"));
        assert!(matches!(
            topology.validate(),
            Err(TopologyValidationError::UnknownExchange { .. })
        ));
    }

    #[test]
    fn duplicate_queue_name_is_rejected() {
        let mut topology = TopologyDescriptor::canonical();
        topology.queues.push(QueueDescriptor::new("ai.tasks"));
        assert!(matches!(
            topology.validate(),
            Err(TopologyValidationError::DuplicateQueue(_))
        ));
    }

    #[test]
    fn zero_max_length_is_rejected() {
        let mut topology = TopologyDescriptor::canonical();
        topology.queues[0].max_length = Some(0);
        assert!(matches!(
            topology.validate(),
            Err(TopologyValidationError::InvalidMaxLength(_))
        ));
    }

    #[test]
    fn out_of_range_max_priority_is_rejected() {
        let mut topology = TopologyDescriptor::canonical();
        topology.queues[0].max_priority = Some(0);
        assert!(matches!(
            topology.validate(),
            Err(TopologyValidationError::InvalidMaxPriority { .. })
        ));
    }
}
