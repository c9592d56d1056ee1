//! # Courier Bus
//!
//! The message bus engine: priority queues with dead-lettering, exchanges
//! with pluggable routing strategies, per-subscription circuit breakers, and
//! the cooperative delivery loop that ties them together.
//!
//! A [`MessageBus`] owns all of its exchanges, queues, subscriptions, and
//! breakers — there is no process-wide registry, so independent bus
//! instances coexist freely (every test builds its own).

pub mod breaker;
pub mod bus;
pub mod dedup;
pub mod exchange;
pub mod queue;
pub mod subscription;

pub use breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use bus::{
    BusStatus, HealthReport, MessageBus, PublishOptions, PublishReceipt, QueueOptions,
    SubscribeOptions,
};
pub use exchange::{Exchange, RoutingStrategy};
pub use queue::{DeadLetter, MessageQueue, NackOutcome, QueueStats};
pub use subscription::{MessageFilter, Subscription, SubscriptionStats};
