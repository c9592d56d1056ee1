//! Message envelope — the immutable value object that flows through the bus.
//!
//! A publisher's payload is wrapped in a `Message` once, at publish time.
//! Every transformation afterwards (retry, reply) produces a *new* message;
//! nothing mutates an envelope after construction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority bounds: 1 is the most urgent, 10 the least.
pub const PRIORITY_HIGHEST: u8 = 1;
pub const PRIORITY_LOWEST: u8 = 10;
pub const PRIORITY_DEFAULT: u8 = 5;

/// What kind of traffic a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Something happened (fire-and-forget fan-out)
    Event,
    /// An instruction for a specific consumer
    Command,
    /// A request expecting a reply
    Query,
    /// The answer to a query
    Reply,
    /// Delivered to every bound queue regardless of key
    Broadcast,
    /// Liveness traffic
    Heartbeat,
    /// An error report travelling over the bus
    Error,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::Event => "event",
            MessageKind::Command => "command",
            MessageKind::Query => "query",
            MessageKind::Reply => "reply",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// An immutable message envelope.
///
/// If a collaborator ever carries messages across a process boundary, these
/// fields are the serialization contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Back-reference to the message this one answers (reply chains)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Back-reference to the message that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Traffic class
    pub kind: MessageKind,

    /// Dot-separated hierarchical subject (e.g. `security.alert.raised`)
    pub topic: String,

    /// Opaque payload — the bus never inspects it beyond filtering
    pub payload: Value,

    /// Logical name of the publisher
    pub source: String,

    /// Intended consumer, when there is exactly one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Time-to-live in milliseconds; 0 = never expires
    #[serde(default)]
    pub ttl_ms: u64,

    /// 1 (highest) … 10 (lowest); clamped at construction
    pub priority: u8,

    /// String-keyed metadata; carries trace propagation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// How many delivery attempts have already failed
    #[serde(default)]
    pub retry_count: u32,

    /// Retry budget before the message is dead-lettered
    pub max_retries: u32,

    /// Deterministic digest of {kind, topic, payload, source}
    pub content_hash: String,
}

impl Message {
    /// Create a message of the given kind with defaults for everything else.
    pub fn new(kind: MessageKind, topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        let topic = topic.into();
        let source = source.into();
        let content_hash = Self::hash_content(kind, &topic, &payload, &source);
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            causation_id: None,
            kind,
            topic,
            payload,
            source,
            destination: None,
            created_at: Utc::now(),
            ttl_ms: 0,
            priority: PRIORITY_DEFAULT,
            headers: HashMap::new(),
            retry_count: 0,
            max_retries: 3,
            content_hash,
        }
    }

    /// Create an event message.
    pub fn event(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self::new(MessageKind::Event, topic, payload, source)
    }

    /// Create a command message.
    pub fn command(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self::new(MessageKind::Command, topic, payload, source)
    }

    /// Create a query message (expects a reply).
    pub fn query(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self::new(MessageKind::Query, topic, payload, source)
    }

    /// Create a broadcast message.
    pub fn broadcast(topic: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self::new(MessageKind::Broadcast, topic, payload, source)
    }

    /// Create a heartbeat message.
    pub fn heartbeat(source: impl Into<String>) -> Self {
        Self::new(MessageKind::Heartbeat, "heartbeat", Value::Null, source)
    }

    /// Set the priority (clamped to 1..=10).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST);
        self
    }

    /// Set the time-to-live in milliseconds (0 = never expires).
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the intended consumer.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Merge metadata headers into the envelope.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        now > self.created_at + Duration::milliseconds(self.ttl_ms as i64)
    }

    /// Whether another delivery attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Derive the next delivery attempt.
    ///
    /// Keeps the id, hash, and creation time (the TTL clock does not reset
    /// on retry); only the retry counter advances.
    pub fn retried(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    /// Derive a reply to this message.
    ///
    /// The reply correlates back to this message's id and is addressed to
    /// this message's source. The replier is whoever this message was
    /// destined for, falling back to the topic owner.
    pub fn reply(&self, payload: Value) -> Self {
        let source = self
            .destination
            .clone()
            .unwrap_or_else(|| self.topic.clone());
        let mut reply = Self::new(MessageKind::Reply, self.topic.clone(), payload, source);
        reply.correlation_id = Some(self.id.clone());
        reply.causation_id = Some(self.id.clone());
        reply.destination = Some(self.source.clone());
        reply.priority = self.priority;
        reply
    }

    /// Deterministic content digest used for exactly-once deduplication.
    ///
    /// Two messages with the same kind, topic, payload, and source hash
    /// identically and count as duplicates.
    fn hash_content(kind: MessageKind, topic: &str, payload: &Value, source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(topic.as_bytes());
        hasher.update(b"\x1f");
        // serde_json orders map keys, so the rendering is canonical
        hasher.update(payload.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(source.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }
}
