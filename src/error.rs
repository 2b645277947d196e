//! Shared error taxonomy.
//!
//! Each subsystem defines its own error enum; this module composes them into
//! a single `CoreError` for callers that span subsystems (e.g. the example
//! binaries under `demos/`). Library code inside a subsystem should keep
//! returning that subsystem's own error type rather than `CoreError`.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::connection::ConnectionError;
use crate::contracts::ContractError;
use crate::events::BusError;
use crate::integrator::IntegratorError;
use crate::scheduler::SchedulerError;
use crate::store_client::StoreError;
use crate::topology::TopologyError;

/// Aggregate error type spanning every subsystem.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Integrator(#[from] IntegratorError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
