//! Bus signals — the observable side-channel of the delivery machinery.
//!
//! Signals report what the bus did (published, delivered, failed, dropped)
//! without carrying payloads. Observers subscribe to the hub and filter for
//! what they care about; publishing never blocks on them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything the bus reports about its own operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum BusSignal {
    /// A message was accepted and routed
    Published {
        message_id: String,
        topic: String,
        destinations: usize,
    },

    /// A handler consumed a message successfully
    Delivered {
        message_id: String,
        subscription_id: String,
    },

    /// A delivery attempt failed (handler error or open breaker)
    Failed {
        message_id: String,
        subscription_id: String,
        reason: String,
    },

    /// No destination queue matched the routing key
    Unroutable { message_id: String, topic: String },

    /// A subscription was registered
    SubscriptionCreated {
        subscription_id: String,
        topic: String,
    },

    /// A subscription was removed
    SubscriptionRemoved { subscription_id: String },
}

impl BusSignal {
    /// The wire name of this signal.
    pub fn name(&self) -> &'static str {
        match self {
            BusSignal::Published { .. } => "message:published",
            BusSignal::Delivered { .. } => "message:delivered",
            BusSignal::Failed { .. } => "message:failed",
            BusSignal::Unroutable { .. } => "message:unroutable",
            BusSignal::SubscriptionCreated { .. } => "subscription:created",
            BusSignal::SubscriptionRemoved { .. } => "subscription:removed",
        }
    }
}

/// A broadcast-based hub for bus signals.
///
/// Uses `tokio::sync::broadcast` for multi-consumer fan-out. Cloning the
/// hub clones the sender; every clone feeds the same observers.
#[derive(Clone)]
pub struct SignalHub {
    sender: broadcast::Sender<Arc<BusSignal>>,
}

impl SignalHub {
    /// Create a hub with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit a signal to all observers.
    pub fn emit(&self, signal: BusSignal) {
        // No observers is fine; the send result is deliberately ignored
        let _ = self.sender.send(Arc::new(signal));
    }

    /// Subscribe to receive signals.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BusSignal>> {
        self.sender.subscribe()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(256)
    }
}
