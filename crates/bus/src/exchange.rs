//! Exchanges — routing tables mapping a routing key to destination queues.
//!
//! An exchange never touches messages; it only answers "which queues does
//! this key reach" under its configured strategy. Bindings change
//! independently of message flow.

use courier_core::{RoutingError, TopicPattern};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// How an exchange picks destination queues for a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Exact routing-key match only
    Direct,
    /// Every bound queue, regardless of key
    Fanout,
    /// Wildcard match (`*`/`#`) against every bound pattern
    Topic,
    /// Exact key, one queue per call via a rotating index
    RoundRobin,
    /// Exact key, the queue with the fewest queued messages
    LeastBusy,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoutingStrategy::Direct => "direct",
            RoutingStrategy::Fanout => "fanout",
            RoutingStrategy::Topic => "topic",
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::LeastBusy => "least_busy",
        };
        write!(f, "{s}")
    }
}

struct Binding {
    key: String,
    /// Compiled only for topic exchanges
    pattern: Option<TopicPattern>,
    queue: String,
}

/// A named routing table.
pub struct Exchange {
    name: String,
    strategy: RoutingStrategy,
    bindings: Vec<Binding>,
    /// Per-key rotating cursor for round-robin
    cursors: HashMap<String, usize>,
}

impl Exchange {
    pub fn new(name: impl Into<String>, strategy: RoutingStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            bindings: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Bind a queue under a routing key.
    ///
    /// Topic exchanges compile the key as a wildcard pattern and reject
    /// malformed ones; other strategies treat the key literally. Binding
    /// the same (key, queue) pair twice is a no-op.
    pub fn bind(&mut self, routing_key: &str, queue: &str) -> Result<(), RoutingError> {
        if self
            .bindings
            .iter()
            .any(|b| b.key == routing_key && b.queue == queue)
        {
            return Ok(());
        }

        let pattern = match self.strategy {
            RoutingStrategy::Topic => Some(TopicPattern::compile(routing_key)?),
            _ => None,
        };

        debug!(exchange = %self.name, routing_key, queue, "Binding queue");
        self.bindings.push(Binding {
            key: routing_key.to_string(),
            pattern,
            queue: queue.to_string(),
        });
        Ok(())
    }

    /// Remove a binding. Returns whether one was removed.
    pub fn unbind(&mut self, routing_key: &str, queue: &str) -> bool {
        let before = self.bindings.len();
        self.bindings
            .retain(|b| !(b.key == routing_key && b.queue == queue));
        before != self.bindings.len()
    }

    /// Remove every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Destination queues for a routing key under this exchange's strategy.
    ///
    /// `depth_of` supplies current queue depths for least-busy selection.
    /// An empty result means the message is unroutable here.
    pub fn route(&mut self, routing_key: &str, depth_of: impl Fn(&str) -> usize) -> Vec<String> {
        match self.strategy {
            RoutingStrategy::Direct => dedup(
                self.bindings
                    .iter()
                    .filter(|b| b.key == routing_key)
                    .map(|b| b.queue.clone()),
            ),
            RoutingStrategy::Fanout => dedup(self.bindings.iter().map(|b| b.queue.clone())),
            RoutingStrategy::Topic => dedup(
                self.bindings
                    .iter()
                    .filter(|b| {
                        b.pattern
                            .as_ref()
                            .is_some_and(|p| p.matches(routing_key))
                    })
                    .map(|b| b.queue.clone()),
            ),
            RoutingStrategy::RoundRobin => {
                let candidates = dedup(
                    self.bindings
                        .iter()
                        .filter(|b| b.key == routing_key)
                        .map(|b| b.queue.clone()),
                );
                if candidates.is_empty() {
                    return Vec::new();
                }
                let cursor = self.cursors.entry(routing_key.to_string()).or_insert(0);
                let picked = candidates[*cursor % candidates.len()].clone();
                *cursor = (*cursor + 1) % candidates.len();
                vec![picked]
            }
            RoutingStrategy::LeastBusy => {
                let candidates = dedup(
                    self.bindings
                        .iter()
                        .filter(|b| b.key == routing_key)
                        .map(|b| b.queue.clone()),
                );
                candidates
                    .into_iter()
                    .min_by_key(|queue| depth_of(queue))
                    .map(|queue| vec![queue])
                    .unwrap_or_default()
            }
        }
    }
}

/// De-duplicate preserving first-seen (bind) order.
fn dedup(queues: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    queues.filter(|q| seen.insert(q.clone())).collect()
}
