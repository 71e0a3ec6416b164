//! HTTP front of the order service.
//!
//! `POST /orders` submits an order through the reply router and maps the
//! outcome to a status code; `GET /products` serves the static catalog.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::{FulfillmentResponse, Order, Outcome, Product, catalog};
use crate::router::{Call, CallTimeout};

/// Whatever performs the order call: either reply strategy.
pub type OrderCaller = Arc<dyn Call<Order, FulfillmentResponse>>;

#[derive(Clone)]
pub struct AppState {
    caller: OrderCaller,
    call_timeout: CallTimeout,
    shutdown: CancellationToken,
}

impl AppState {
    /// Orders still waiting when `shutdown` fires end as `cancelled`.
    pub fn new(caller: OrderCaller, call_timeout: CallTimeout, shutdown: CancellationToken) -> Self {
        Self {
            caller,
            call_timeout,
            shutdown,
        }
    }
}

/// Body returned by `POST /orders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub outcome: Outcome,
}

/// Body returned when the order itself is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Status code for a call outcome.
pub fn status_for(outcome: Outcome) -> StatusCode {
    match outcome {
        Outcome::Accepted => StatusCode::CREATED,
        Outcome::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
        Outcome::TimedOut => StatusCode::REQUEST_TIMEOUT,
        Outcome::TransportAbandoned => StatusCode::SERVICE_UNAVAILABLE,
        Outcome::Cancelled | Outcome::PublishFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn create_order(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<OrderResponse>), (StatusCode, Json<ErrorResponse>)> {
    // Malformed bodies are 400; 422 is reserved for rejected orders
    let order: Order = serde_json::from_slice(&body).map_err(|e| {
        warn!(target: "reply_router::http", "Rejected malformed order: {}", e);
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    info!(
        target: "reply_router::http",
        "Received order {} with {} items",
        order.id,
        order.items.len()
    );

    // A client disconnect drops this future instead; the dispatcher's guard
    // deregisters the call either way
    let cancel = state.shutdown.child_token();
    let outcome = Outcome::from(
        state
            .caller
            .call(&order, state.call_timeout.as_duration(), &cancel)
            .await,
    );

    info!(
        target: "reply_router::http",
        "Order {} finished: {:?}",
        order.id,
        outcome
    );

    Ok((
        status_for(outcome),
        Json(OrderResponse {
            order_id: order.id,
            outcome,
        }),
    ))
}

async fn list_products() -> Json<Vec<Product>> {
    Json(catalog())
}

/// Build the application router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/products", get(list_products))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "reply_router::http", "Order service listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
