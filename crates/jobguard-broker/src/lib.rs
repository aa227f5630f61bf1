//! jobguard-broker
//!
//! The queue-adapter contract (spec.md §4.4) and its three broker-family
//! implementations (spec.md §4.6). Selection is by an explicit
//! `queue_type` config value, not runtime duck-typing over the broker
//! object — spec.md §9's "Patterns requiring re-architecture" calls for
//! exactly this: a configuration-supplied discriminant dispatching to the
//! matching adapter variant.

mod base;
mod bee;
mod bull;
mod bullmq;
mod contract;
mod sanitize;

use std::sync::Arc;

use jobguard_db::{QueueType, Repository};
use jobguard_logging::Logger;

pub use base::{AdapterLimits, DisposeGuard, QueueAdapter, ReenqueueOutcome};
pub use bee::BeeAdapter;
pub use bull::BullAdapter;
pub use bullmq::BullMqAdapter;
pub use contract::{BrokerEvent, BrokerJobState, QueueBroker};
pub use sanitize::sanitize_error;

/// Builds the adapter matching `queue_type`, wiring up its event consumer.
/// There is no "unsupported" branch to return from here — `QueueType`
/// itself is already the closed, validated set spec.md §9 calls for; an
/// unrecognized string is rejected earlier, at `QueueType::parse`.
pub fn build_adapter<B: QueueBroker + 'static>(
    queue_type: QueueType,
    broker: Arc<B>,
    repository: Arc<Repository>,
    queue_name: String,
    limits: AdapterLimits,
    logger: Logger,
) -> Arc<dyn QueueAdapter> {
    match queue_type {
        QueueType::Bull => Arc::new(BullAdapter::new(broker, repository, queue_name, limits, logger)),
        QueueType::BullMq => {
            Arc::new(BullMqAdapter::new(broker, repository, queue_name, limits, logger))
        }
        QueueType::Bee => Arc::new(BeeAdapter::new(broker, repository, queue_name, limits, logger)),
    }
}
