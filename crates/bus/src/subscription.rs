//! Subscriptions — a topic pattern bound to a handler, with concurrency
//! and filter configuration.
//!
//! The subscription is also the backpressure gate: `can_process` caps how
//! many handler invocations may be in flight at once, so one slow consumer
//! cannot accumulate unbounded concurrent work.

use courier_core::{Message, MessageHandler, RoutingError, TopicPattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How a subscription narrows the messages it receives beyond the pattern.
#[derive(Clone)]
pub enum MessageFilter {
    /// Arbitrary predicate over the envelope
    Predicate(Arc<dyn Fn(&Message) -> bool + Send + Sync>),
    /// Field-equality match against envelope fields, then payload fields
    Fields(HashMap<String, Value>),
}

impl std::fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageFilter::Predicate(_) => f.write_str("MessageFilter::Predicate(..)"),
            MessageFilter::Fields(fields) => {
                f.debug_tuple("MessageFilter::Fields").field(fields).finish()
            }
        }
    }
}

/// Point-in-time counters for one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub id: String,
    pub topic: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub processing: usize,
    pub processed: u64,
    pub errors: u64,
    pub active: bool,
}

/// A registered consumer: pattern, handler, filter, and running counters.
pub struct Subscription {
    pub id: String,
    /// The pattern as subscribed
    pub topic: String,
    pattern: TopicPattern,
    pub handler: Arc<dyn MessageHandler>,
    pub filter: Option<MessageFilter>,
    /// Consumer-group tag, reserved for load-balanced groups
    pub group: Option<String>,
    /// The backing queue this subscription drains
    pub queue: String,
    /// Whether the queue was created for this subscription (and dies with it)
    pub owns_queue: bool,
    pub max_concurrent: usize,
    pub processing: usize,
    pub processed: u64,
    pub errors: u64,
    pub active: bool,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        queue: impl Into<String>,
        max_concurrent: usize,
    ) -> Result<Self, RoutingError> {
        Ok(Self {
            id: id.into(),
            topic: topic.to_string(),
            pattern: TopicPattern::compile(topic)?,
            handler,
            filter: None,
            group: None,
            queue: queue.into(),
            owns_queue: false,
            max_concurrent,
            processing: 0,
            processed: 0,
            errors: 0,
            active: true,
        })
    }

    /// Whether a concrete topic matches this subscription's pattern.
    pub fn matches(&self, topic: &str) -> bool {
        self.pattern.matches(topic)
    }

    /// Whether a message clears the configured filter (no filter = pass).
    pub fn passes_filter(&self, message: &Message) -> bool {
        match &self.filter {
            None => true,
            Some(MessageFilter::Predicate(predicate)) => predicate(message),
            Some(MessageFilter::Fields(fields)) => fields
                .iter()
                .all(|(key, expected)| field_value(message, key).as_ref() == Some(expected)),
        }
    }

    /// The backpressure gate: active and below the concurrency cap.
    pub fn can_process(&self) -> bool {
        self.active && self.processing < self.max_concurrent
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            id: self.id.clone(),
            topic: self.topic.clone(),
            queue: self.queue.clone(),
            group: self.group.clone(),
            processing: self.processing,
            processed: self.processed,
            errors: self.errors,
            active: self.active,
        }
    }
}

/// Look up a filterable field: envelope fields first, then payload fields.
fn field_value(message: &Message, key: &str) -> Option<Value> {
    match key {
        "id" => Some(Value::String(message.id.clone())),
        "kind" => serde_json::to_value(message.kind).ok(),
        "topic" => Some(Value::String(message.topic.clone())),
        "source" => Some(Value::String(message.source.clone())),
        "destination" => message.destination.clone().map(Value::String),
        "correlation_id" => message.correlation_id.clone().map(Value::String),
        "priority" => Some(Value::from(message.priority)),
        _ => message.payload.get(key).cloned(),
    }
}
