//! Trace context — correlation metadata propagated alongside each message.
//!
//! A causal chain shares one `trace_id`; every hop gets a fresh `span_id`
//! and remembers its parent's. The context rides in message headers so it
//! survives any boundary the envelope itself survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Header keys used to carry the context on a message.
pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_SPAN_ID: &str = "x-span-id";
pub const HEADER_PARENT_SPAN_ID: &str = "x-parent-span-id";

/// Correlation/causation identifiers for one hop of a causal chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceContext {
    /// Stable across the whole causal chain
    pub trace_id: String,

    /// Unique per hop
    pub span_id: String,

    /// The span that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,

    /// Free-form baggage carried along the chain
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub baggage: HashMap<String, String>,

    /// When this span started
    pub started_at: DateTime<Utc>,
}

impl TraceContext {
    /// Start a new root context.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            baggage: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Derive a child context: same trace, fresh span, this span as parent.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
            baggage: self.baggage.clone(),
            started_at: Utc::now(),
        }
    }

    /// Attach a baggage entry.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    /// Render the context into message headers.
    pub fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(HEADER_TRACE_ID.to_string(), self.trace_id.clone());
        headers.insert(HEADER_SPAN_ID.to_string(), self.span_id.clone());
        if let Some(parent) = &self.parent_span_id {
            headers.insert(HEADER_PARENT_SPAN_ID.to_string(), parent.clone());
        }
        headers
    }

    /// Reconstruct a context from message headers, if one was stamped.
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        let trace_id = headers.get(HEADER_TRACE_ID)?.clone();
        let span_id = headers.get(HEADER_SPAN_ID)?.clone();
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: headers.get(HEADER_PARENT_SPAN_ID).cloned(),
            baggage: HashMap::new(),
            started_at: Utc::now(),
        })
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}
