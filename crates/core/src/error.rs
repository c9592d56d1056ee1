//! Error types for the Courier domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Courier operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Routing / binding configuration errors (fatal to the caller) ---
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    // --- Delivery errors (recovered or surfaced per operation) ---
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors raised synchronously by routing and binding configuration.
///
/// These are programmer errors: publishing to an exchange that was never
/// created, binding a queue that does not exist, subscribing with a
/// malformed pattern. They surface immediately instead of being retried.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Exchange already exists: {0}")]
    ExchangeExists(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue already exists: {0}")]
    QueueExists(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors arising while delivering messages or awaiting replies.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Circuit breaker open for subscription {subscription_id}")]
    CircuitOpen { subscription_id: String },

    #[error("Request on '{topic}' timed out after {timeout_ms}ms")]
    RequestTimeout { topic: String, timeout_ms: u64 },

    #[error("Reply channel closed for correlation {correlation_id}")]
    ReplyChannelClosed { correlation_id: String },
}

/// The error a message handler reports back to the delivery loop.
///
/// The bus treats every handler failure the same way (retry, then
/// dead-letter), so a reason string is all the loop needs.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}
