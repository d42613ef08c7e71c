use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Broker-assigned identifier for one delivery of one message. Carries the
/// redelivery/acknowledgement state, never the payload.
pub type DeliveryTag = u64;

/// Queues that receive rejected (non-requeued) messages are named after the
/// queue the message came from, with this suffix appended.
pub const STASH_SUFFIX: &str = "/stash";

/// One message handed to a consumer, pending acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub payload: Vec<u8>,
    /// True when the message was previously delivered and negatively
    /// acknowledged back onto the queue.
    pub redelivered: bool,
}

/// An active subscription: the stream of deliveries plus the tag used to
/// cancel it. Dropping the receiver does not cancel the subscription.
#[derive(Debug)]
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),
    #[error("delivery {0} is not awaiting acknowledgement")]
    UnknownDelivery(DeliveryTag),
    #[error("consumer '{0}' is not active")]
    UnknownConsumer(String),
    #[error("broker connection is closed")]
    Closed,
}

/// At-least-once delivery queue client.
///
/// Semantics every implementation must uphold:
/// - a consumer holds at most `prefetch` unacknowledged deliveries at a time;
/// - `nack` returns the message to the front of its queue for redelivery;
/// - `reject` drops the message from its queue and routes it to the queue's
///   stash sibling (`<queue>/stash`) for manual inspection;
/// - after `cancel`, no further deliveries are pushed to the subscription.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make sure a queue exists. Publishing and consuming require it.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Fire-and-forget publish. The queue is created if it does not exist.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Begin consuming from a queue with the given prefetch limit.
    async fn consume(&self, queue: &str, prefetch: usize) -> Result<Subscription, BrokerError>;

    /// Acknowledge a delivery: the message is done and removed.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Negative acknowledgement: the message goes back onto its queue.
    async fn nack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject without requeue: the message is routed to the stash queue.
    async fn reject(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Stop a subscription. Unacknowledged deliveries stay pending and can
    /// still be acked, nacked or rejected.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Release broker resources. Messages still unacknowledged at close time
    /// are returned to their queues.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Name of the stash queue for a given source queue.
pub fn stash_queue_name(queue: &str) -> String {
    format!("{queue}{STASH_SUFFIX}")
}
