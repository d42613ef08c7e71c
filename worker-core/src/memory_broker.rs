use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{
    stash_queue_name, Broker, BrokerError, Delivery, DeliveryTag, Subscription,
};

/// A message sitting in a queue, waiting to be delivered.
#[derive(Debug, Clone)]
struct QueuedMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerState {
    queue: String,
    prefetch: usize,
    /// Number of deliveries handed out and not yet resolved.
    unacked: usize,
    /// None once the consumer is cancelled.
    tx: Option<mpsc::UnboundedSender<Delivery>>,
}

struct PendingDelivery {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<DeliveryTag, PendingDelivery>,
    next_delivery_tag: DeliveryTag,
    next_consumer_id: u64,
    closed: bool,
}

/// In-process broker with the same delivery contract as a real message
/// queue: per-consumer prefetch limits, at-least-once redelivery on negative
/// acknowledgement, and reject-to-stash routing. One instance is shared by
/// every worker in a process (and by tests).
#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently waiting in a queue, not counting unacknowledged
    /// deliveries.
    pub fn queue_len(&self, queue: &str) -> usize {
        let inner = self.lock();
        inner.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages routed to the stash sibling of a queue.
    pub fn stash_len(&self, queue: &str) -> usize {
        self.queue_len(&stash_queue_name(queue))
    }

    /// Deliveries handed out and not yet acked, nacked or rejected.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Subscriptions that have not been cancelled.
    pub fn active_consumers(&self) -> usize {
        self.lock()
            .consumers
            .values()
            .filter(|c| c.tx.is_some())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hand queued messages to consumers with spare prefetch capacity.
    /// Called after every state change that could unblock a delivery.
    fn dispatch(inner: &mut Inner, queue: &str) {
        loop {
            let Some(ready) = inner.queues.get_mut(queue) else {
                return;
            };
            if ready.is_empty() {
                return;
            }

            // Pick the active consumer on this queue with the most headroom.
            let candidate = inner
                .consumers
                .iter()
                .filter(|(_, c)| c.queue == queue && c.tx.is_some() && c.unacked < c.prefetch)
                .max_by_key(|(_, c)| c.prefetch - c.unacked)
                .map(|(tag, _)| tag.clone());

            let Some(consumer_tag) = candidate else {
                return;
            };

            let Some(message) = ready.pop_front() else {
                return;
            };

            let tag = inner.next_delivery_tag;
            inner.next_delivery_tag += 1;

            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
            };

            let consumer = inner
                .consumers
                .get_mut(&consumer_tag)
                .expect("consumer was selected while the lock was held");
            let sent = consumer
                .tx
                .as_ref()
                .map(|tx| tx.send(delivery).is_ok())
                .unwrap_or(false);

            if sent {
                consumer.unacked += 1;
                inner.unacked.insert(
                    tag,
                    PendingDelivery {
                        queue: queue.to_string(),
                        consumer_tag,
                        message,
                    },
                );
            } else {
                // Receiver dropped without cancelling; put the message back
                // and forget the consumer.
                warn!(consumer = %consumer_tag, "consumer channel dropped, requeueing");
                consumer.tx = None;
                if let Some(ready) = inner.queues.get_mut(queue) {
                    ready.push_front(message);
                }
            }
        }
    }

    /// Resolve one unacknowledged delivery and free its prefetch slot.
    fn settle(inner: &mut Inner, tag: DeliveryTag) -> Result<PendingDelivery, BrokerError> {
        let pending = inner
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        if let Some(consumer) = inner.consumers.get_mut(&pending.consumer_tag) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        Ok(pending)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        inner.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(QueuedMessage {
                payload,
                redelivered: false,
            });
        Self::dispatch(&mut inner, queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Subscription, BrokerError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        let consumer_tag = format!("ctag-{}", inner.next_consumer_id);
        inner.next_consumer_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.consumers.insert(
            consumer_tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                prefetch: prefetch.max(1),
                unacked: 0,
                tx: Some(tx),
            },
        );
        debug!(queue, consumer = %consumer_tag, prefetch, "consumer registered");
        Self::dispatch(&mut inner, queue);

        Ok(Subscription {
            consumer_tag,
            deliveries: rx,
        })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let pending = Self::settle(&mut inner, tag)?;
        Self::dispatch(&mut inner, &pending.queue);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let mut pending = Self::settle(&mut inner, tag)?;
        pending.message.redelivered = true;
        inner
            .queues
            .entry(pending.queue.clone())
            .or_default()
            .push_front(pending.message);
        Self::dispatch(&mut inner, &pending.queue);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let pending = Self::settle(&mut inner, tag)?;
        let stash = stash_queue_name(&pending.queue);
        inner
            .queues
            .entry(stash.clone())
            .or_default()
            .push_back(pending.message);
        Self::dispatch(&mut inner, &stash);
        Self::dispatch(&mut inner, &pending.queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let consumer = inner
            .consumers
            .get_mut(consumer_tag)
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer_tag.to_string()))?;
        // Dropping the sender closes the subscription stream once the
        // receiver drains what was already pushed.
        consumer.tx = None;
        debug!(consumer = %consumer_tag, "consumer cancelled");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner.closed = true;
        for consumer in inner.consumers.values_mut() {
            consumer.tx = None;
        }
        // Return unacknowledged messages to their queues so another
        // connection can pick them up.
        let tags: Vec<DeliveryTag> = inner.unacked.keys().copied().collect();
        for tag in tags {
            if let Some(mut pending) = inner.unacked.remove(&tag) {
                pending.message.redelivered = true;
                inner
                    .queues
                    .entry(pending.queue)
                    .or_default()
                    .push_front(pending.message);
            }
        }
        Ok(())
    }
}
