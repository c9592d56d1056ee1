//! The message bus orchestrator.
//!
//! One `MessageBus` owns its exchanges, queues, subscriptions, breakers,
//! pending replies, and counters. Publishing only enqueues; a cooperative
//! delivery loop (one spawned task ticking at a fixed interval) pulls from
//! queues and invokes handlers, each invocation as its own task so a slow
//! consumer never stalls the loop.

use crate::breaker::{BreakerState, BreakerStats, CircuitBreaker};
use crate::dedup::DedupWindow;
use crate::exchange::{Exchange, RoutingStrategy};
use crate::queue::{MessageQueue, QueueStats};
use crate::subscription::{MessageFilter, Subscription, SubscriptionStats};
use courier_config::{BusConfig, DeliveryPolicy};
use courier_core::{
    BusSignal, DeliveryError, Message, MessageHandler, MessageKind, Result, RoutingError,
    SignalHub, TraceContext,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exchange every non-broadcast publish routes through unless overridden.
pub const DEFAULT_TOPIC_EXCHANGE: &str = "bus.topic";
/// Exchange broadcasts route through unless overridden.
pub const DEFAULT_FANOUT_EXCHANGE: &str = "bus.fanout";

const SOURCE_UNATTRIBUTED: &str = "anonymous";

/// Options accepted by `publish` (and `command`/`broadcast`).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub kind: Option<MessageKind>,
    pub ttl_ms: Option<u64>,
    pub priority: Option<u8>,
    pub headers: HashMap<String, String>,
    pub exchange: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub max_retries: Option<u32>,
    pub source: Option<String>,
}

/// What `publish` reports back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub routed: bool,
    pub duplicate: bool,
    pub message_id: String,
    pub destinations: Vec<String>,
}

/// Options accepted by `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub exchange: Option<String>,
    /// Share an existing queue instead of creating a dedicated one
    pub queue: Option<String>,
    pub filter: Option<MessageFilter>,
    pub group: Option<String>,
    pub max_concurrent: Option<usize>,
}

/// Options accepted by `create_queue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    pub max_size: Option<usize>,
    pub max_dead_letter: Option<usize>,
}

/// Aggregate bus counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatus {
    pub running: bool,
    pub exchanges: usize,
    pub queues: usize,
    pub subscriptions: usize,
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub unroutable: u64,
    pub duplicates_dropped: u64,
}

/// The health summary collaborators poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub open_circuit_breakers: usize,
    pub pending_messages: usize,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: u64,
    delivered: u64,
    failed: u64,
    unroutable: u64,
    duplicates_dropped: u64,
}

/// Everything the bus owns, behind one lock.
struct BusState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, MessageQueue>,
    subscriptions: HashMap<String, Subscription>,
    breakers: HashMap<String, CircuitBreaker>,
    pending_replies: HashMap<String, oneshot::Sender<Value>>,
    recent_hashes: DedupWindow,
    counters: BusCounters,
}

/// One planned dispatch, computed under the lock and executed outside it.
enum Planned {
    /// Handler admitted by the breaker; invoke it in its own task
    Invoke {
        message: Message,
        handler: Arc<dyn MessageHandler>,
        queue: String,
    },
    /// Breaker open: fail the delivery without invoking the handler
    Rejected { message: Message, queue: String },
}

/// The in-process message bus.
pub struct MessageBus {
    config: BusConfig,
    state: Arc<RwLock<BusState>>,
    signals: SignalHub,
    running: Arc<AtomicBool>,
}

impl MessageBus {
    /// Build a bus from configuration.
    ///
    /// The default topic and fanout exchanges exist from the start; the
    /// delivery loop does not run until [`MessageBus::start`].
    pub fn new(config: BusConfig) -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_TOPIC_EXCHANGE.to_string(),
            Exchange::new(DEFAULT_TOPIC_EXCHANGE, RoutingStrategy::Topic),
        );
        exchanges.insert(
            DEFAULT_FANOUT_EXCHANGE.to_string(),
            Exchange::new(DEFAULT_FANOUT_EXCHANGE, RoutingStrategy::Fanout),
        );

        let signals = SignalHub::new(config.signal_buffer);
        let state = BusState {
            exchanges,
            queues: HashMap::new(),
            subscriptions: HashMap::new(),
            breakers: HashMap::new(),
            pending_replies: HashMap::new(),
            recent_hashes: DedupWindow::new(config.delivery.dedup_window),
            counters: BusCounters::default(),
        };

        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            signals,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Observe bus signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<Arc<BusSignal>> {
        self.signals.subscribe()
    }

    // ── Topology ────────────────────────────────────────────────────────────

    /// Create a named exchange.
    pub async fn create_exchange(&self, name: &str, strategy: RoutingStrategy) -> Result<()> {
        let mut st = self.state.write().await;
        if st.exchanges.contains_key(name) {
            return Err(RoutingError::ExchangeExists(name.to_string()).into());
        }
        info!(exchange = %name, strategy = %strategy, "Exchange created");
        st.exchanges.insert(name.to_string(), Exchange::new(name, strategy));
        Ok(())
    }

    /// Create a named queue.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut st = self.state.write().await;
        if st.queues.contains_key(name) {
            return Err(RoutingError::QueueExists(name.to_string()).into());
        }
        let max_size = options.max_size.unwrap_or(self.config.queue.max_size);
        let max_dead_letter = options
            .max_dead_letter
            .unwrap_or(self.config.queue.max_dead_letter);
        info!(queue = %name, max_size, "Queue created");
        st.queues
            .insert(name.to_string(), MessageQueue::new(name, max_size, max_dead_letter));
        Ok(())
    }

    /// Bind a queue to an exchange under a routing key.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut st = self.state.write().await;
        if !st.queues.contains_key(queue) {
            return Err(RoutingError::QueueNotFound(queue.to_string()).into());
        }
        let ex = st
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RoutingError::ExchangeNotFound(exchange.to_string()))?;
        ex.bind(routing_key, queue)?;
        info!(queue = %queue, exchange = %exchange, routing_key, "Queue bound");
        Ok(())
    }

    // ── Publishing ──────────────────────────────────────────────────────────

    /// Publish a payload under a topic.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let message = self.build_message(topic, payload, &options);
        let exchange = options
            .exchange
            .unwrap_or_else(|| default_exchange_for(message.kind).to_string());
        self.dispatch(message, &exchange).await
    }

    /// Publish with kind `command`.
    pub async fn command(
        &self,
        topic: &str,
        payload: Value,
        mut options: PublishOptions,
    ) -> Result<PublishReceipt> {
        options.kind = Some(MessageKind::Command);
        self.publish(topic, payload, options).await
    }

    /// Publish with kind `broadcast` (routes through the fanout exchange).
    pub async fn broadcast(
        &self,
        topic: &str,
        payload: Value,
        mut options: PublishOptions,
    ) -> Result<PublishReceipt> {
        options.kind = Some(MessageKind::Broadcast);
        self.publish(topic, payload, options).await
    }

    /// Publish a query and await its reply.
    ///
    /// The pending entry is registered before the message is routed, so a
    /// subscriber replying immediately can never race the registration. An
    /// unroutable request still waits out the timeout: a subscriber may
    /// bind before the deadline.
    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout =
            timeout.unwrap_or(Duration::from_millis(self.config.delivery.request_timeout_ms));
        let options = PublishOptions {
            kind: Some(MessageKind::Query),
            ..Default::default()
        };
        let message = self.build_message(topic, payload, &options);
        let message_id = message.id.clone();

        let (tx, rx) = oneshot::channel();
        self.state
            .write()
            .await
            .pending_replies
            .insert(message_id.clone(), tx);

        if let Err(err) = self.dispatch(message, DEFAULT_TOPIC_EXCHANGE).await {
            self.state.write().await.pending_replies.remove(&message_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(DeliveryError::ReplyChannelClosed {
                correlation_id: message_id,
            }
            .into()),
            Err(_) => {
                self.state.write().await.pending_replies.remove(&message_id);
                debug!(topic = %topic, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(DeliveryError::RequestTimeout {
                    topic: topic.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Answer a query.
    ///
    /// Resolves the waiting `request` caller if one is pending for the
    /// original message; otherwise the reply is published like any other
    /// message (the caller may have timed out).
    pub async fn reply(&self, original: &Message, payload: Value) -> Result<()> {
        let reply = original.reply(payload);
        {
            let mut st = self.state.write().await;
            if let Some(correlation_id) = &reply.correlation_id
                && let Some(tx) = st.pending_replies.remove(correlation_id)
            {
                debug!(correlation_id = %correlation_id, "Resolving pending request");
                let _ = tx.send(reply.payload);
                return Ok(());
            }
        }
        self.dispatch(reply, DEFAULT_TOPIC_EXCHANGE).await.map(|_| ())
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Register a handler for a topic pattern.
    ///
    /// Without an explicit queue, a dedicated one is created and bound to
    /// the exchange with the pattern as routing key; it is removed again on
    /// unsubscribe. An explicit queue is shared and created on first use.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<String>
    where
        H: MessageHandler + 'static,
    {
        let subscription_id = Uuid::new_v4().to_string();
        let exchange_name = options
            .exchange
            .unwrap_or_else(|| DEFAULT_TOPIC_EXCHANGE.to_string());
        let (queue_name, owns_queue) = match options.queue {
            Some(name) => (name, false),
            None => (format!("q.{subscription_id}"), true),
        };
        let max_concurrent = options
            .max_concurrent
            .unwrap_or(self.config.delivery.default_max_concurrent);

        let mut subscription = Subscription::new(
            &subscription_id,
            topic,
            Arc::new(handler),
            &queue_name,
            max_concurrent,
        )?;
        subscription.filter = options.filter;
        subscription.group = options.group;
        subscription.owns_queue = owns_queue;

        let mut guard = self.state.write().await;
        let BusState {
            exchanges,
            queues,
            subscriptions,
            breakers,
            ..
        } = &mut *guard;
        let Some(exchange) = exchanges.get_mut(&exchange_name) else {
            return Err(RoutingError::ExchangeNotFound(exchange_name).into());
        };
        if !queues.contains_key(&queue_name) {
            queues.insert(
                queue_name.clone(),
                MessageQueue::new(
                    &queue_name,
                    self.config.queue.max_size,
                    self.config.queue.max_dead_letter,
                ),
            );
        }
        exchange.bind(topic, &queue_name)?;
        breakers.insert(
            subscription_id.clone(),
            CircuitBreaker::new(
                self.config.breaker.failure_threshold,
                self.config.breaker.success_threshold,
                Duration::from_millis(self.config.breaker.timeout_ms),
            ),
        );
        subscriptions.insert(subscription_id.clone(), subscription);

        info!(
            subscription_id = %subscription_id,
            topic = %topic,
            queue = %queue_name,
            exchange = %exchange_name,
            "Subscription created"
        );
        self.signals.emit(BusSignal::SubscriptionCreated {
            subscription_id: subscription_id.clone(),
            topic: topic.to_string(),
        });
        Ok(subscription_id)
    }

    /// Remove a subscription.
    ///
    /// Future dispatch stops immediately; in-flight handler invocations
    /// complete but their outcome is discarded. A queue created for this
    /// subscription is removed along with its bindings.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut st = self.state.write().await;
        let Some(subscription) = st.subscriptions.remove(subscription_id) else {
            return false;
        };
        st.breakers.remove(subscription_id);
        if subscription.owns_queue {
            st.queues.remove(&subscription.queue);
            for exchange in st.exchanges.values_mut() {
                exchange.unbind_queue(&subscription.queue);
            }
        }
        info!(subscription_id = %subscription_id, "Subscription removed");
        self.signals.emit(BusSignal::SubscriptionRemoved {
            subscription_id: subscription_id.to_string(),
        });
        true
    }

    /// Stop dispatching to a subscription without losing queued work.
    pub async fn pause_subscription(&self, subscription_id: &str) -> bool {
        let mut st = self.state.write().await;
        match st.subscriptions.get_mut(subscription_id) {
            Some(subscription) => {
                subscription.active = false;
                true
            }
            None => false,
        }
    }

    /// Resume a paused subscription.
    pub async fn resume_subscription(&self, subscription_id: &str) -> bool {
        let mut st = self.state.write().await;
        match st.subscriptions.get_mut(subscription_id) {
            Some(subscription) => {
                subscription.active = true;
                true
            }
            None => false,
        }
    }

    /// Re-enqueue up to `n` dead-letters from a queue. Operator-triggered.
    pub async fn replay_dead_letter(&self, queue: &str, n: usize) -> Result<usize> {
        let mut st = self.state.write().await;
        let q = st
            .queues
            .get_mut(queue)
            .ok_or_else(|| RoutingError::QueueNotFound(queue.to_string()))?;
        Ok(q.replay_dead_letter(n))
    }

    // ── Delivery loop ───────────────────────────────────────────────────────

    /// Start the delivery loop. Idempotent; returns the loop task handle.
    pub fn start(&self) -> JoinHandle<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Delivery loop already running");
            return tokio::spawn(async {});
        }

        let state = Arc::clone(&self.state);
        let signals = self.signals.clone();
        let running = Arc::clone(&self.running);
        let tick = Duration::from_millis(self.config.delivery.tick_interval_ms);
        let budget = self.config.delivery.dispatch_budget;

        info!(tick_ms = tick.as_millis() as u64, budget, "Delivery loop started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    debug!("Delivery loop stopped");
                    break;
                }
                Self::tick(&state, &signals, budget).await;
            }
        })
    }

    /// Stop the delivery loop after the current tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One pass over all subscriptions, bounded by the dispatch budget.
    async fn tick(state: &Arc<RwLock<BusState>>, signals: &SignalHub, budget: usize) {
        let subscription_ids: Vec<String> =
            state.read().await.subscriptions.keys().cloned().collect();

        let mut dispatched = 0;
        for subscription_id in subscription_ids {
            if dispatched >= budget {
                break;
            }
            let planned = Self::plan_dispatch(&mut *state.write().await, &subscription_id);
            match planned {
                None => {}
                Some(Planned::Rejected { message, queue }) => {
                    dispatched += 1;
                    Self::settle(
                        state,
                        signals,
                        &subscription_id,
                        &queue,
                        &message,
                        Err("circuit breaker open".to_string()),
                        false,
                    )
                    .await;
                }
                Some(Planned::Invoke {
                    message,
                    handler,
                    queue,
                }) => {
                    dispatched += 1;
                    let state = Arc::clone(state);
                    let signals = signals.clone();
                    let subscription_id = subscription_id.clone();
                    // Each invocation settles independently; the loop moves on
                    tokio::spawn(async move {
                        let outcome = handler
                            .handle(message.clone())
                            .await
                            .map_err(|err| err.to_string());
                        Self::settle(
                            &state,
                            &signals,
                            &subscription_id,
                            &queue,
                            &message,
                            outcome,
                            true,
                        )
                        .await;
                    });
                }
            }
        }
    }

    /// Decide what (if anything) to dispatch for one subscription.
    fn plan_dispatch(st: &mut BusState, subscription_id: &str) -> Option<Planned> {
        let BusState {
            subscriptions,
            queues,
            breakers,
            ..
        } = st;

        let subscription = subscriptions.get_mut(subscription_id)?;
        if !subscription.can_process() {
            return None;
        }
        let queue_name = subscription.queue.clone();
        let queue = queues.get_mut(&queue_name)?;
        let message = queue.dequeue()?;

        if !subscription.matches(&message.topic) {
            // Belongs to a different subscriber sharing this queue
            queue.requeue(&message.id);
            return None;
        }
        if !subscription.passes_filter(&message) {
            // Filtered-out messages are consumed, not redelivered
            queue.ack(&message.id);
            return None;
        }

        let breaker = breakers.get_mut(subscription_id)?;
        match breaker.try_acquire() {
            Err(_) => Some(Planned::Rejected {
                message,
                queue: queue_name,
            }),
            Ok(()) => {
                subscription.processing += 1;
                Some(Planned::Invoke {
                    handler: Arc::clone(&subscription.handler),
                    message,
                    queue: queue_name,
                })
            }
        }
    }

    /// Apply a delivery outcome: queue ack/nack, counters, breaker, signals.
    ///
    /// `invoked` is false for breaker-open rejections, which count against
    /// retry accounting but never touched the handler or the breaker. If
    /// the subscription was removed while the handler ran, only the queue
    /// bookkeeping survives; the rest of the outcome is discarded.
    async fn settle(
        state: &Arc<RwLock<BusState>>,
        signals: &SignalHub,
        subscription_id: &str,
        queue_name: &str,
        message: &Message,
        outcome: std::result::Result<(), String>,
        invoked: bool,
    ) {
        let mut guard = state.write().await;
        let st = &mut *guard;

        match &outcome {
            Ok(()) => {
                if let Some(queue) = st.queues.get_mut(queue_name) {
                    queue.ack(&message.id);
                }
            }
            Err(reason) => {
                if let Some(queue) = st.queues.get_mut(queue_name) {
                    queue.nack(&message.id, reason);
                }
            }
        }

        let Some(subscription) = st.subscriptions.get_mut(subscription_id) else {
            debug!(
                subscription_id = %subscription_id,
                message_id = %message.id,
                "Discarding settle for removed subscription"
            );
            return;
        };
        if invoked {
            subscription.processing = subscription.processing.saturating_sub(1);
        }

        match outcome {
            Ok(()) => {
                subscription.processed += 1;
                if invoked && let Some(breaker) = st.breakers.get_mut(subscription_id) {
                    breaker.record_success();
                }
                st.counters.delivered += 1;
                debug!(
                    message_id = %message.id,
                    subscription_id = %subscription_id,
                    "Message delivered"
                );
                signals.emit(BusSignal::Delivered {
                    message_id: message.id.clone(),
                    subscription_id: subscription_id.to_string(),
                });
            }
            Err(reason) => {
                subscription.errors += 1;
                if invoked && let Some(breaker) = st.breakers.get_mut(subscription_id) {
                    breaker.record_failure();
                }
                st.counters.failed += 1;
                warn!(
                    message_id = %message.id,
                    subscription_id = %subscription_id,
                    reason = %reason,
                    "Delivery failed"
                );
                signals.emit(BusSignal::Failed {
                    message_id: message.id.clone(),
                    subscription_id: subscription_id.to_string(),
                    reason,
                });
            }
        }
    }

    // ── Status queries ──────────────────────────────────────────────────────

    pub async fn status(&self) -> BusStatus {
        let st = self.state.read().await;
        BusStatus {
            running: self.running.load(Ordering::SeqCst),
            exchanges: st.exchanges.len(),
            queues: st.queues.len(),
            subscriptions: st.subscriptions.len(),
            published: st.counters.published,
            delivered: st.counters.delivered,
            failed: st.counters.failed,
            unroutable: st.counters.unroutable,
            duplicates_dropped: st.counters.duplicates_dropped,
        }
    }

    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        let st = self.state.read().await;
        let mut stats: Vec<QueueStats> = st.queues.values().map(MessageQueue::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub async fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        let st = self.state.read().await;
        let mut stats: Vec<SubscriptionStats> =
            st.subscriptions.values().map(Subscription::stats).collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    pub async fn circuit_breaker_stats(&self) -> HashMap<String, BreakerStats> {
        let st = self.state.read().await;
        st.breakers
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.stats()))
            .collect()
    }

    pub async fn health_check(&self) -> HealthReport {
        let st = self.state.read().await;
        let open = st
            .breakers
            .values()
            .filter(|b| b.state() == BreakerState::Open)
            .count();
        let pending = st.queues.values().map(MessageQueue::depth).sum();
        HealthReport {
            healthy: open == 0,
            open_circuit_breakers: open,
            pending_messages: pending,
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Wrap a payload in an envelope, stamping trace context into headers.
    ///
    /// A chain carried in the caller's headers continues as a child span;
    /// otherwise a fresh root context is started.
    fn build_message(&self, topic: &str, payload: Value, options: &PublishOptions) -> Message {
        let kind = options.kind.unwrap_or(MessageKind::Event);
        let source = options
            .source
            .clone()
            .unwrap_or_else(|| SOURCE_UNATTRIBUTED.to_string());

        let ctx = TraceContext::from_headers(&options.headers)
            .map(|parent| parent.child())
            .unwrap_or_default();
        let mut headers = options.headers.clone();
        headers.extend(ctx.to_headers());

        let mut message = Message::new(kind, topic, payload, source)
            .with_headers(headers)
            .with_max_retries(
                options
                    .max_retries
                    .unwrap_or(self.config.delivery.default_max_retries),
            );
        if let Some(priority) = options.priority {
            message = message.with_priority(priority);
        }
        if let Some(ttl_ms) = options.ttl_ms {
            message = message.with_ttl_ms(ttl_ms);
        }
        if let Some(correlation_id) = &options.correlation_id {
            message = message.with_correlation_id(correlation_id.clone());
        }
        if let Some(causation_id) = &options.causation_id {
            message = message.with_causation_id(causation_id.clone());
        }
        message
    }

    /// Route a built message through an exchange and enqueue it everywhere
    /// it lands. The duplicate check happens here, under the same lock as
    /// routing, so concurrent publishers cannot slip past the window.
    async fn dispatch(&self, message: Message, exchange: &str) -> Result<PublishReceipt> {
        let mut guard = self.state.write().await;
        let st = &mut *guard;

        if self.config.delivery.policy == DeliveryPolicy::ExactlyOnce
            && st.recent_hashes.observe(&message.content_hash)
        {
            st.counters.duplicates_dropped += 1;
            debug!(
                message_id = %message.id,
                topic = %message.topic,
                "Dropping duplicate publish"
            );
            return Ok(PublishReceipt {
                routed: false,
                duplicate: true,
                message_id: message.id,
                destinations: Vec::new(),
            });
        }

        let BusState {
            exchanges,
            queues,
            counters,
            ..
        } = st;
        let Some(ex) = exchanges.get_mut(exchange) else {
            return Err(RoutingError::ExchangeNotFound(exchange.to_string()).into());
        };
        let destinations =
            ex.route(&message.topic, |queue| queues.get(queue).map_or(0, MessageQueue::depth));

        if destinations.is_empty() {
            counters.unroutable += 1;
            warn!(
                message_id = %message.id,
                topic = %message.topic,
                exchange = %exchange,
                "Unroutable message"
            );
            self.signals.emit(BusSignal::Unroutable {
                message_id: message.id.clone(),
                topic: message.topic.clone(),
            });
            return Ok(PublishReceipt {
                routed: false,
                duplicate: false,
                message_id: message.id,
                destinations: Vec::new(),
            });
        }

        for queue_name in &destinations {
            match queues.get_mut(queue_name) {
                Some(queue) => {
                    queue.enqueue(message.clone());
                }
                None => warn!(queue = %queue_name, "Binding references a missing queue, skipping"),
            }
        }

        counters.published += 1;
        debug!(
            message_id = %message.id,
            topic = %message.topic,
            destinations = destinations.len(),
            "Message published"
        );
        self.signals.emit(BusSignal::Published {
            message_id: message.id.clone(),
            topic: message.topic.clone(),
            destinations: destinations.len(),
        });
        Ok(PublishReceipt {
            routed: true,
            duplicate: false,
            message_id: message.id,
            destinations,
        })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn default_exchange_for(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Broadcast => DEFAULT_FANOUT_EXCHANGE,
        _ => DEFAULT_TOPIC_EXCHANGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Error, HandlerError};
    use serde_json::json;

    fn noop(_message: Message) -> impl std::future::Future<Output = std::result::Result<(), HandlerError>>
    {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn publish_routes_to_subscribed_queue() {
        let bus = MessageBus::default();
        bus.subscribe("orders.#", noop, SubscribeOptions::default())
            .await
            .unwrap();

        let receipt = bus
            .publish("orders.created", json!({"id": 1}), PublishOptions::default())
            .await
            .unwrap();
        assert!(receipt.routed);
        assert!(!receipt.duplicate);
        assert_eq!(receipt.destinations.len(), 1);

        let stats = bus.queue_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].depth, 1);
    }

    #[tokio::test]
    async fn unroutable_publish_is_reported_not_dropped_silently() {
        let bus = MessageBus::default();
        let mut signals = bus.subscribe_signals();

        let receipt = bus
            .publish("nobody.listens", Value::Null, PublishOptions::default())
            .await
            .unwrap();
        assert!(!receipt.routed);
        assert!(receipt.destinations.is_empty());

        let signal = signals.recv().await.unwrap();
        assert_eq!(signal.name(), "message:unroutable");
        assert_eq!(bus.status().await.unroutable, 1);
    }

    #[tokio::test]
    async fn exactly_once_drops_duplicate_content() {
        let mut config = BusConfig::default();
        config.delivery.policy = DeliveryPolicy::ExactlyOnce;
        let bus = MessageBus::new(config);
        bus.subscribe("metrics.#", noop, SubscribeOptions::default())
            .await
            .unwrap();

        let first = bus
            .publish("metrics.cpu", json!({"pct": 93}), PublishOptions::default())
            .await
            .unwrap();
        let second = bus
            .publish("metrics.cpu", json!({"pct": 93}), PublishOptions::default())
            .await
            .unwrap();

        assert!(first.routed);
        assert!(second.duplicate);
        assert!(!second.routed);
        assert_eq!(bus.queue_stats().await[0].depth, 1);
        assert_eq!(bus.status().await.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn at_least_once_delivers_duplicates() {
        let bus = MessageBus::default();
        bus.subscribe("metrics.#", noop, SubscribeOptions::default())
            .await
            .unwrap();

        for _ in 0..2 {
            let receipt = bus
                .publish("metrics.cpu", json!({"pct": 93}), PublishOptions::default())
                .await
                .unwrap();
            assert!(receipt.routed);
        }
        assert_eq!(bus.queue_stats().await[0].depth, 2);
    }

    #[tokio::test]
    async fn duplicate_exchange_rejected() {
        let bus = MessageBus::default();
        bus.create_exchange("work", RoutingStrategy::Direct)
            .await
            .unwrap();
        let err = bus
            .create_exchange("work", RoutingStrategy::Direct)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::ExchangeExists(_))
        ));
    }

    #[tokio::test]
    async fn publish_to_unknown_exchange_is_fatal() {
        let bus = MessageBus::default();
        let err = bus
            .publish(
                "t",
                Value::Null,
                PublishOptions {
                    exchange: Some("ghost".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::ExchangeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn bind_requires_existing_queue_and_exchange() {
        let bus = MessageBus::default();
        let err = bus
            .bind_queue("ghost", DEFAULT_TOPIC_EXCHANGE, "k")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::QueueNotFound(_))));

        bus.create_queue("q", QueueOptions::default()).await.unwrap();
        let err = bus.bind_queue("q", "ghost", "k").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::ExchangeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_rejects_invalid_pattern() {
        let bus = MessageBus::default();
        let err = bus
            .subscribe("a.#.b", noop, SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn unsubscribe_removes_owned_queue_and_bindings() {
        let bus = MessageBus::default();
        let id = bus
            .subscribe("a.b", noop, SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(bus.queue_stats().await.len(), 1);

        assert!(bus.unsubscribe(&id).await);
        assert!(bus.queue_stats().await.is_empty());
        assert!(bus.circuit_breaker_stats().await.is_empty());

        // Publishing afterwards routes nowhere
        let receipt = bus
            .publish("a.b", Value::Null, PublishOptions::default())
            .await
            .unwrap();
        assert!(!receipt.routed);

        assert!(!bus.unsubscribe(&id).await);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_shared_queue_alone() {
        let bus = MessageBus::default();
        bus.create_queue("shared", QueueOptions::default())
            .await
            .unwrap();
        let id = bus
            .subscribe(
                "a.b",
                noop,
                SubscribeOptions {
                    queue: Some("shared".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(bus.unsubscribe(&id).await);
        assert_eq!(bus.queue_stats().await.len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_active() {
        let bus = MessageBus::default();
        let id = bus
            .subscribe("a.b", noop, SubscribeOptions::default())
            .await
            .unwrap();

        assert!(bus.pause_subscription(&id).await);
        assert!(!bus.subscription_stats().await[0].active);
        assert!(bus.resume_subscription(&id).await);
        assert!(bus.subscription_stats().await[0].active);
        assert!(!bus.pause_subscription("ghost").await);
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_fanout_subscriber() {
        let bus = MessageBus::default();
        for _ in 0..2 {
            bus.subscribe(
                "announcements",
                noop,
                SubscribeOptions {
                    exchange: Some(DEFAULT_FANOUT_EXCHANGE.into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let receipt = bus
            .broadcast("announcements", json!("hello"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt.destinations.len(), 2);
        for stats in bus.queue_stats().await {
            assert_eq!(stats.depth, 1);
        }
    }

    #[tokio::test]
    async fn health_check_counts_pending_and_breakers() {
        let bus = MessageBus::default();
        bus.subscribe("a.#", noop, SubscribeOptions::default())
            .await
            .unwrap();
        bus.publish("a.b", Value::Null, PublishOptions::default())
            .await
            .unwrap();

        let health = bus.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.open_circuit_breakers, 0);
        assert_eq!(health.pending_messages, 1);
    }

    #[tokio::test]
    async fn replay_dead_letter_requires_known_queue() {
        let bus = MessageBus::default();
        let err = bus.replay_dead_letter("ghost", 5).await.unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn publish_stamps_trace_headers() {
        let bus = MessageBus::default();
        bus.subscribe("traced", noop, SubscribeOptions::default())
            .await
            .unwrap();

        // A publish without a chain starts a root context
        bus.publish("traced", Value::Null, PublishOptions::default())
            .await
            .unwrap();
        let rooted = {
            let mut st = bus.state.write().await;
            st.queues.values_mut().next().unwrap().dequeue().unwrap()
        };
        let root = TraceContext::from_headers(&rooted.headers).unwrap();
        assert!(root.parent_span_id.is_none());

        // Headers carrying a parent continue the chain as a child span
        let parent = TraceContext::new();
        bus.publish(
            "traced",
            Value::Null,
            PublishOptions {
                headers: parent.to_headers(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let chained = {
            let mut st = bus.state.write().await;
            st.queues.values_mut().next().unwrap().dequeue().unwrap()
        };
        let child = TraceContext::from_headers(&chained.headers).unwrap();
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(parent.span_id.as_str()));
        assert_ne!(child.span_id, parent.span_id);
    }
}
