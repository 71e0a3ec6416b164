//! In-process broker.
//!
//! Models the subset of AMQP queue semantics the router depends on:
//!
//! - Named queues plus server-named reply queues (`amq.gen-<ulid>`)
//! - One consumer per queue
//! - At-least-once delivery: every delivery stays unacked until acked, and a
//!   nack with requeue hands it out again with `redelivered` set
//! - Unacked deliveries of a consumer that went away are requeued when the
//!   next consumer attaches
//! - `shutdown()` ends every subscription with `ConnectionClosed`

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use ulid::Ulid;

use super::{Delivery, Message, Subscription, Transport, TransportError};
use crate::error::LockResultExt;
use crate::router::protocol::ReplyAddress;

/// Prefix of server-named reply queues.
pub const REPLY_QUEUE_PREFIX: &str = "amq.gen-";

type ConsumerSender = mpsc::UnboundedSender<Result<Delivery, TransportError>>;

#[derive(Default)]
struct QueueState {
    /// Messages waiting for a consumer, with their redelivered flag.
    ready: VecDeque<(Message, bool)>,
    consumer: Option<ConsumerSender>,
    /// Handed out, not yet acked, keyed by delivery tag.
    unacked: HashMap<u64, Message>,
}

impl QueueState {
    fn has_live_consumer(&self) -> bool {
        self.consumer.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Hand a message to the consumer, or park it if there is none.
    fn deliver(&mut self, queue: &str, next_tag: &mut u64, message: Message, redelivered: bool) {
        let Some(consumer) = self.consumer.as_ref() else {
            self.ready.push_back((message, redelivered));
            return;
        };

        *next_tag += 1;
        let tag = *next_tag;
        let delivery = Delivery {
            queue: queue.to_string(),
            tag,
            redelivered,
            message: message.clone(),
        };

        if consumer.send(Ok(delivery)).is_ok() {
            self.unacked.insert(tag, message);
        } else {
            self.consumer = None;
            self.ready.push_back((message, redelivered));
        }
    }
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    closed: bool,
}

/// Broker living inside the process.
///
/// Cheap to share behind an `Arc`; all state sits behind one mutex.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                queues: HashMap::new(),
                next_tag: 0,
                closed: false,
            }),
        }
    }

    /// Declare a named queue. Idempotent.
    pub fn declare_queue(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().recover_poison("MemoryBroker::declare_queue");
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Close the connection: every subscription receives `ConnectionClosed`
    /// and every later operation fails.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().recover_poison("MemoryBroker::shutdown");
        if state.closed {
            return;
        }
        state.closed = true;
        for queue in state.queues.values_mut() {
            if let Some(consumer) = queue.consumer.take() {
                let _ = consumer.send(Err(TransportError::ConnectionClosed));
            }
        }
        debug!(target: "reply_router::broker", "Broker shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().recover_poison("MemoryBroker::is_closed").closed
    }

    pub fn has_queue(&self, name: &str) -> bool {
        let state = self.state.lock().recover_poison("MemoryBroker::has_queue");
        state.queues.contains_key(name)
    }

    /// Messages waiting on `name` for a consumer.
    pub fn ready_count(&self, name: &str) -> Option<usize> {
        let state = self.state.lock().recover_poison("MemoryBroker::ready_count");
        state.queues.get(name).map(|q| q.ready.len())
    }

    /// Deliveries on `name` handed out but not yet acked.
    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        let state = self.state.lock().recover_poison("MemoryBroker::unacked_count");
        state.queues.get(name).map(|q| q.unacked.len())
    }

    fn settle(&self, delivery: &Delivery, requeue: Option<bool>) -> Result<(), TransportError> {
        let mut guard = self.state.lock().recover_poison("MemoryBroker::settle");
        let state = &mut *guard;
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let queue = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::UnknownDestination(delivery.queue.clone()))?;
        let message =
            queue
                .unacked
                .remove(&delivery.tag)
                .ok_or_else(|| TransportError::UnknownDelivery {
                    queue: delivery.queue.clone(),
                    tag: delivery.tag,
                })?;

        if requeue == Some(true) {
            debug!(
                target: "reply_router::broker",
                "Requeueing delivery {} on {}",
                delivery.tag,
                delivery.queue
            );
            queue.deliver(&delivery.queue, &mut state.next_tag, message, true);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_reply_channel(&self) -> Result<ReplyAddress, TransportError> {
        let name = format!("{}{}", REPLY_QUEUE_PREFIX, Ulid::new());
        self.declare_queue(&name)?;
        debug!(target: "reply_router::broker", "Declared reply queue {}", name);
        Ok(ReplyAddress::from(name))
    }

    async fn publish(&self, destination: &str, message: Message) -> Result<(), TransportError> {
        let mut guard = self.state.lock().recover_poison("MemoryBroker::publish");
        let state = &mut *guard;
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let Some(queue) = state.queues.get_mut(destination) else {
            warn!(
                target: "reply_router::broker",
                "Publish to unknown destination {}",
                destination
            );
            return Err(TransportError::UnknownDestination(destination.to_string()));
        };
        queue.deliver(destination, &mut state.next_tag, message, false);
        Ok(())
    }

    async fn consume(&self, address: &str) -> Result<Subscription, TransportError> {
        let mut guard = self.state.lock().recover_poison("MemoryBroker::consume");
        let state = &mut *guard;
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| TransportError::UnknownDestination(address.to_string()))?;
        if queue.has_live_consumer() {
            return Err(TransportError::AlreadyConsumed(address.to_string()));
        }

        // Deliveries owned by a departed consumer go back first
        let mut orphaned: Vec<_> = queue.unacked.drain().collect();
        orphaned.sort_by_key(|(tag, _)| *tag);
        for (_, message) in orphaned.into_iter().rev() {
            queue.ready.push_front((message, true));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumer = Some(tx);
        let backlog: Vec<_> = queue.ready.drain(..).collect();
        for (message, redelivered) in backlog {
            queue.deliver(address, &mut state.next_tag, message, redelivered);
        }

        Ok(Subscription::new(address, rx))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.settle(delivery, None)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.settle(delivery, Some(requeue))
    }

    async fn delete_channel(&self, address: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().recover_poison("MemoryBroker::delete_channel");
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        match state.queues.remove(address) {
            Some(_) => {
                debug!(target: "reply_router::broker", "Deleted queue {}", address);
                Ok(())
            }
            None => Err(TransportError::UnknownDestination(address.to_string())),
        }
    }
}
