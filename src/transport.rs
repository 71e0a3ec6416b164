//! Broker capability interface.
//!
//! The router never talks to a broker protocol directly. Everything it needs
//! from the broker is expressed by the [`Transport`] trait: declare a reply
//! channel, publish a tagged message, consume a channel as a lazy stream, and
//! acknowledge deliveries.
//!
//! [`memory::MemoryBroker`] is the in-process implementation used by the
//! binary and by the tests.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::router::protocol::{CorrelationId, ReplyAddress};

/// Content type set on every envelope the crate publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Failure of a broker operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No queue is bound to the destination
    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    /// The queue already has its single consumer
    #[error("queue already has a consumer: {0}")]
    AlreadyConsumed(String),

    /// The delivery tag is not outstanding on the queue
    #[error("unknown delivery tag {tag} on {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    /// The connection to the broker is gone
    #[error("connection closed")]
    ConnectionClosed,
}

/// A message as handed to [`Transport::publish`].
///
/// Mirrors the properties an AMQP publishing carries: the correlation id and
/// reply address travel beside the body, not only inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<ReplyAddress>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    /// Build a JSON message with the given properties.
    pub fn json(
        body: Vec<u8>,
        correlation_id: Option<CorrelationId>,
        reply_to: Option<ReplyAddress>,
    ) -> Self {
        Self {
            correlation_id,
            reply_to,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body,
        }
    }
}

/// A message handed out by a [`Subscription`].
///
/// Each delivery must be acked or nacked through the transport it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub redelivered: bool,
    pub message: Message,
}

/// Lazy, potentially infinite stream of deliveries for one queue.
///
/// `None` means the transport dropped the subscription; an `Err` item reports
/// why it is going away.
pub struct Subscription {
    queue: String,
    rx: mpsc::UnboundedReceiver<Result<Delivery, TransportError>>,
}

impl Subscription {
    pub fn new(
        queue: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Result<Delivery, TransportError>>,
    ) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    /// Name of the consumed queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery.
    pub async fn next(&mut self) -> Option<Result<Delivery, TransportError>> {
        self.rx.recv().await
    }
}

/// Publish/subscribe primitives of the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declare a server-named reply channel and return its address.
    async fn declare_reply_channel(&self) -> Result<ReplyAddress, TransportError>;

    /// Publish `message` to the queue named `destination`.
    async fn publish(&self, destination: &str, message: Message) -> Result<(), TransportError>;

    /// Start consuming `address`. A queue accepts one consumer at a time.
    async fn consume(&self, address: &str) -> Result<Subscription, TransportError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivery, optionally putting it back on its queue.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Tear down a channel declared with [`Transport::declare_reply_channel`].
    async fn delete_channel(&self, address: &str) -> Result<(), TransportError>;
}
