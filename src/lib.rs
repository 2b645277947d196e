//! AMQP message broker and in-memory AI task scheduling core for a
//! distributed workspace system.
//!
//! Modules are layered bottom-up: [`config`] and [`contracts`] have no
//! dependencies on the rest of the crate; [`connection`] and [`topology`]
//! sit on top of the AMQP client directly; [`broker`] composes both into the
//! publish/consume/RPC surface that [`scheduler`], [`events`], and
//! [`integrator`] are all built on.

pub mod broker;
pub mod config;
pub mod connection;
pub mod contracts;
pub mod error;
pub mod events;
pub mod integrator;
pub mod scheduler;
pub mod store_client;
pub mod topology;

pub use broker::{AmqpBroker, MessageBroker};
pub use config::CoreConfig;
pub use connection::ConnectionManager;
pub use error::CoreError;
pub use events::{EventPublisher, EventSubscriber};
pub use integrator::ServiceIntegrator;
pub use scheduler::AITaskScheduler;
pub use topology::TopologyManager;

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`
/// (falling back to `info`). Every binary calls this before doing
/// anything else.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
