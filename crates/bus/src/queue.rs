//! Priority-ordered message queue with an attached dead-letter store.
//!
//! Entries are kept priority-ascending (1 before 10), FIFO among equal
//! priorities. Dequeued messages move to an in-flight map until they are
//! acknowledged or negatively acknowledged; exhausted or expired messages
//! land in a bounded dead-letter buffer instead of vanishing.

use chrono::{DateTime, Utc};
use courier_core::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why a message was dead-lettered.
pub const REASON_OVERFLOW: &str = "queue_overflow";
pub const REASON_EXPIRED: &str = "expired";

/// A message retained for inspection after it could not be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// What `nack` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// A retried copy went back into the queue
    Requeued,
    /// The retry budget was exhausted; the message was dead-lettered
    DeadLettered,
    /// The id was not in flight
    Unknown,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub depth: usize,
    pub in_flight: usize,
    /// Age of the longest-running in-flight message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_in_flight_ms: Option<u64>,
    pub dead_letters: usize,
    pub enqueued_total: u64,
    pub dead_lettered_total: u64,
}

struct InFlight {
    message: Message,
    since: Instant,
}

/// A named, bounded, priority-ordered buffer of undelivered messages.
pub struct MessageQueue {
    name: String,
    max_size: usize,
    max_dead_letter: usize,
    entries: VecDeque<Message>,
    in_flight: HashMap<String, InFlight>,
    dead: VecDeque<DeadLetter>,
    enqueued_total: u64,
    dead_lettered_total: u64,
}

impl MessageQueue {
    pub fn new(name: impl Into<String>, max_size: usize, max_dead_letter: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            max_dead_letter,
            entries: VecDeque::new(),
            in_flight: HashMap::new(),
            dead: VecDeque::new(),
            enqueued_total: 0,
            dead_lettered_total: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queued (non-acknowledged, not in-flight) message count.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Insert a message, keeping priority order (FIFO among equals).
    ///
    /// At capacity, the lowest-priority message among the residents and the
    /// candidate is dead-lettered with reason `queue_overflow`; a tie keeps
    /// the earlier arrival. Returns whether the candidate was stored.
    pub fn enqueue(&mut self, message: Message) -> bool {
        if self.entries.len() >= self.max_size {
            match self.entries.back() {
                // The candidate is the lowest priority (or ties the current
                // lowest): it loses, preserving arrival order among equals.
                Some(back) if message.priority >= back.priority => {
                    warn!(
                        queue = %self.name,
                        message_id = %message.id,
                        priority = message.priority,
                        "Queue full, dead-lettering incoming message"
                    );
                    self.dead_letter(message, REASON_OVERFLOW);
                    return false;
                }
                _ => {
                    if let Some(evicted) = self.entries.pop_back() {
                        warn!(
                            queue = %self.name,
                            message_id = %evicted.id,
                            priority = evicted.priority,
                            "Queue full, evicting lowest-priority message"
                        );
                        self.dead_letter(evicted, REASON_OVERFLOW);
                    }
                }
            }
        }

        let at = self
            .entries
            .partition_point(|queued| queued.priority <= message.priority);
        self.entries.insert(at, message);
        self.enqueued_total += 1;
        true
    }

    /// Pop the front message, dead-lettering any expired entries on the way.
    ///
    /// The returned message moves to the in-flight map until `ack`, `nack`,
    /// or `requeue` resolves it.
    pub fn dequeue(&mut self) -> Option<Message> {
        let now = Utc::now();
        while let Some(message) = self.entries.pop_front() {
            if message.is_expired(now) {
                debug!(queue = %self.name, message_id = %message.id, "Dropping expired message");
                self.dead_letter(message, REASON_EXPIRED);
                continue;
            }
            self.in_flight.insert(
                message.id.clone(),
                InFlight {
                    message: message.clone(),
                    since: Instant::now(),
                },
            );
            return Some(message);
        }
        None
    }

    /// Acknowledge successful processing.
    pub fn ack(&mut self, id: &str) -> bool {
        self.in_flight.remove(id).is_some()
    }

    /// Report failed processing: retry if budget remains, else dead-letter.
    pub fn nack(&mut self, id: &str, reason: &str) -> NackOutcome {
        let Some(entry) = self.in_flight.remove(id) else {
            return NackOutcome::Unknown;
        };

        if entry.message.can_retry() {
            let attempt = entry.message.retried();
            debug!(
                queue = %self.name,
                message_id = %attempt.id,
                retry_count = attempt.retry_count,
                "Re-queueing failed message"
            );
            self.enqueue(attempt);
            NackOutcome::Requeued
        } else {
            warn!(
                queue = %self.name,
                message_id = %entry.message.id,
                reason = %reason,
                "Retry budget exhausted, dead-lettering"
            );
            self.dead_letter(entry.message, reason);
            NackOutcome::DeadLettered
        }
    }

    /// Return an in-flight message to the queue unchanged.
    ///
    /// Used when a dequeued message belongs to a different subscriber
    /// sharing this queue; the retry counter does not advance.
    pub fn requeue(&mut self, id: &str) -> bool {
        let Some(entry) = self.in_flight.remove(id) else {
            return false;
        };
        let at = self
            .entries
            .partition_point(|queued| queued.priority <= entry.message.priority);
        self.entries.insert(at, entry.message);
        true
    }

    /// Re-enqueue up to `n` dead-letters with their retry budget restored.
    ///
    /// An operator-triggered recovery action, never automatic.
    pub fn replay_dead_letter(&mut self, n: usize) -> usize {
        let mut replayed = 0;
        while replayed < n {
            let Some(dead) = self.dead.pop_front() else {
                break;
            };
            let mut message = dead.message;
            message.retry_count = 0;
            self.enqueue(message);
            replayed += 1;
        }
        if replayed > 0 {
            debug!(queue = %self.name, replayed, "Replayed dead-letters");
        }
        replayed
    }

    /// The retained dead-letters, oldest first.
    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead.iter()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            depth: self.entries.len(),
            in_flight: self.in_flight.len(),
            oldest_in_flight_ms: self
                .in_flight
                .values()
                .map(|entry| entry.since.elapsed().as_millis() as u64)
                .max(),
            dead_letters: self.dead.len(),
            enqueued_total: self.enqueued_total,
            dead_lettered_total: self.dead_lettered_total,
        }
    }

    fn dead_letter(&mut self, message: Message, reason: &str) {
        self.dead.push_back(DeadLetter {
            message,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.dead_lettered_total += 1;
        // Bounded: oldest evicted first
        while self.dead.len() > self.max_dead_letter {
            self.dead.pop_front();
        }
    }
}
