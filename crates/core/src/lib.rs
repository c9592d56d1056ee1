//! # Courier Core
//!
//! Domain types, traits, and error definitions for the Courier message bus.
//! This crate has **zero engine dependencies** — it defines the envelope,
//! pattern, and signal vocabulary that the bus crate implements against.
//!
//! ## Design Philosophy
//!
//! Everything a collaborator touches lives here: the immutable [`Message`]
//! envelope, the [`MessageHandler`] trait subscriptions implement, the
//! [`BusSignal`] observability channel, and the error taxonomy. The engine
//! (queues, exchanges, breakers, the delivery loop) depends inward on this
//! crate, never the other way around.

pub mod error;
pub mod handler;
pub mod message;
pub mod signal;
pub mod topic;
pub mod trace;

// Re-export key types at crate root for ergonomics
pub use error::{DeliveryError, Error, HandlerError, Result, RoutingError};
pub use handler::MessageHandler;
pub use message::{Message, MessageKind};
pub use signal::{BusSignal, SignalHub};
pub use topic::TopicPattern;
pub use trace::TraceContext;
