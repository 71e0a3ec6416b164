//! Order fulfillment domain types.
//!
//! These are the payloads that flow through the router: the order service
//! publishes an [`Order`], the fulfillment worker answers with a
//! [`FulfillmentResponse`], and the call result is folded into an [`Outcome`].

use serde::{Deserialize, Serialize};

use crate::router::CallOutcome;
use crate::router::protocol::{CorrelationId, RequestEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub items: Vec<Product>,
}

/// Request published to the fulfillment worker.
pub type FulfillmentRequest = RequestEnvelope<Order>;

/// Reply published by the fulfillment worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentResponse {
    pub correlation_id: CorrelationId,
    pub can_fulfill_order: bool,
}

/// Result of submitting an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    TimedOut,
    Cancelled,
    PublishFailed,
    TransportAbandoned,
}

impl From<CallOutcome<FulfillmentResponse>> for Outcome {
    fn from(outcome: CallOutcome<FulfillmentResponse>) -> Self {
        match outcome.map(|response| response.can_fulfill_order) {
            CallOutcome::Replied(true) => Outcome::Accepted,
            CallOutcome::Replied(false) => Outcome::Rejected,
            CallOutcome::TimedOut => Outcome::TimedOut,
            CallOutcome::Cancelled => Outcome::Cancelled,
            CallOutcome::PublishFailed(_) => Outcome::PublishFailed,
            CallOutcome::TransportAbandoned(_) => Outcome::TransportAbandoned,
        }
    }
}

/// Static product catalog served by `GET /products`.
pub fn catalog() -> Vec<Product> {
    vec![
        Product {
            id: "1".to_string(),
            name: "Product 1".to_string(),
        },
        Product {
            id: "2".to_string(),
            name: "Product 2".to_string(),
        },
    ]
}
