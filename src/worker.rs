//! Fulfillment worker.
//!
//! Consumes fulfillment requests, decides whether each order can be
//! fulfilled, and publishes the decision to the request's reply address under
//! the request's correlation id.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{FulfillmentRequest, FulfillmentResponse, Order};
use crate::error::LockResultExt;
use crate::transport::{Delivery, Message, Subscription, Transport};

/// Decides whether an order can be fulfilled.
pub trait Decide: Send + Sync + 'static {
    fn decide(&self, order: &Order) -> bool;
}

impl<F> Decide for F
where
    F: Fn(&Order) -> bool + Send + Sync + 'static,
{
    fn decide(&self, order: &Order) -> bool {
        self(order)
    }
}

/// Coin-flip decision from a generator seeded once at startup.
pub struct RandomDecision {
    rng: Mutex<StdRng>,
}

impl RandomDecision {
    /// Seed from `seed`, or from OS entropy when `None`.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Decide for RandomDecision {
    fn decide(&self, _order: &Order) -> bool {
        self.rng
            .lock()
            .recover_poison("RandomDecision::decide")
            .gen_bool(0.5)
    }
}

/// Handle to a running worker. Dropping it stops the worker.
pub struct WorkerHandle {
    join_handle: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl WorkerHandle {
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Spawn a worker serving `subscription`.
pub fn spawn_fulfillment_worker<T: Transport>(
    transport: Arc<T>,
    subscription: Subscription,
    decider: Arc<dyn Decide>,
) -> WorkerHandle {
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(worker_loop(
        transport,
        subscription,
        decider,
        cancel_token.clone(),
    ));
    WorkerHandle {
        join_handle: Some(join_handle),
        cancel_token,
    }
}

async fn worker_loop<T: Transport>(
    transport: Arc<T>,
    mut subscription: Subscription,
    decider: Arc<dyn Decide>,
    cancel_token: CancellationToken,
) {
    info!(
        target: "reply_router::worker",
        "Waiting for fulfillment requests on {}",
        subscription.queue()
    );

    loop {
        let delivery = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,
            next = subscription.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(target: "reply_router::worker", "Request subscription failed: {}", e);
                    break;
                }
                None => break,
            },
        };

        handle_request(transport.as_ref(), &delivery, decider.as_ref()).await;

        if let Err(e) = transport.ack(&delivery).await {
            warn!(
                target: "reply_router::worker",
                "Failed to ack request {}: {}",
                delivery.tag,
                e
            );
            break;
        }
    }

    debug!(target: "reply_router::worker", "Fulfillment worker stopped");
}

/// Decide one request and publish the reply. Returns the decision, if one
/// was made.
async fn handle_request<T: Transport>(
    transport: &T,
    delivery: &Delivery,
    decider: &dyn Decide,
) -> Option<bool> {
    let request = match FulfillmentRequest::from_message(&delivery.message) {
        Ok(request) => request,
        Err(e) => {
            warn!(target: "reply_router::worker", "Error decoding request: {}", e);
            return None;
        }
    };

    let can_fulfill_order = decider.decide(&request.payload);
    let response = FulfillmentResponse {
        correlation_id: request.correlation_id.clone(),
        can_fulfill_order,
    };
    let body = match serde_json::to_vec(&response) {
        Ok(body) => body,
        Err(e) => {
            warn!(target: "reply_router::worker", "Error encoding response: {}", e);
            return None;
        }
    };

    let reply = Message::json(body, Some(request.correlation_id.clone()), None);
    match transport.publish(request.reply_to.as_str(), reply).await {
        Ok(()) => {
            debug!(
                target: "reply_router::worker",
                "Replied to {} for order {} with can_fulfill={}",
                request.correlation_id,
                request.payload.id,
                can_fulfill_order
            );
        }
        Err(e) => {
            warn!(target: "reply_router::worker", "Failed to publish reply: {}", e);
        }
    }
    Some(can_fulfill_order)
}
