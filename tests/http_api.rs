//! HTTP surface of the order service, driven without a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use reply_router::domain::{FulfillmentResponse, Order, Outcome, Product};
use reply_router::http::{AppState, OrderCaller, OrderResponse, app_router};
use reply_router::worker::{WorkerHandle, spawn_fulfillment_worker};
use reply_router::{CallTimeout, MemoryBroker, ReplyRouter, Transport};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const REQUESTS: &str = "fulfillment_requests";

struct App {
    router: Router,
    shutdown: CancellationToken,
    _reply_router: ReplyRouter<MemoryBroker, FulfillmentResponse>,
    _worker: Option<WorkerHandle>,
}

async fn app(decision: Option<bool>, call_timeout: CallTimeout) -> App {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare_queue(REQUESTS).unwrap();

    let worker = match decision {
        Some(decision) => {
            let requests = broker.consume(REQUESTS).await.unwrap();
            Some(spawn_fulfillment_worker(
                Arc::clone(&broker),
                requests,
                Arc::new(move |_: &Order| decision),
            ))
        }
        None => None,
    };

    let reply_router = ReplyRouter::start(Arc::clone(&broker), REQUESTS).await.unwrap();
    let caller: OrderCaller = Arc::new(reply_router.dispatcher().clone());
    let shutdown = CancellationToken::new();

    App {
        router: app_router(AppState::new(caller, call_timeout, shutdown.clone())),
        shutdown,
        _reply_router: reply_router,
        _worker: worker,
    }
}

fn post_order(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/orders")
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

fn widget_order() -> String {
    json!({"id": "o1", "items": [{"id": "p1", "name": "Widget"}]}).to_string()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn accepted_order_returns_created() {
    let app = app(Some(true), CallTimeout::default()).await;

    let response = app.router.oneshot(post_order(widget_order())).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: OrderResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(
        body,
        OrderResponse {
            order_id: "o1".to_string(),
            outcome: Outcome::Accepted,
        }
    );
}

#[tokio::test]
async fn rejected_order_returns_unprocessable() {
    let app = app(Some(false), CallTimeout::default()).await;

    let response = app.router.oneshot(post_order(widget_order())).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body_json(response).await,
        json!({"order_id": "o1", "outcome": "rejected"})
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_order_returns_request_timeout() {
    let app = app(None, CallTimeout::from_millis(250).unwrap()).await;

    let response = app.router.oneshot(post_order(widget_order())).await.unwrap();

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(
        body_json(response).await,
        json!({"order_id": "o1", "outcome": "timed_out"})
    );
}

#[tokio::test]
async fn malformed_order_is_a_bad_request() {
    let app = app(Some(true), CallTimeout::default()).await;

    let response = app.router.oneshot(post_order("{\"id\": 1")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn stopped_reply_consumer_returns_service_unavailable() {
    let app = app(Some(true), CallTimeout::default()).await;
    let App {
        router,
        _reply_router,
        _worker,
        ..
    } = app;
    _reply_router.shutdown().await;

    let response = router.oneshot(post_order(widget_order())).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_orders_in_flight() {
    let app = app(None, CallTimeout::default()).await;
    let shutdown = app.shutdown.clone();
    let request = tokio::spawn(app.router.oneshot(post_order(widget_order())));

    // Let the order reach the broker, well inside the call timeout
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    shutdown.cancel();

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        json!({"order_id": "o1", "outcome": "cancelled"})
    );
}

#[tokio::test]
async fn products_lists_the_catalog() {
    let app = app(None, CallTimeout::default()).await;

    let response = app
        .router
        .oneshot(Request::builder().uri("/products").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let products: Vec<Product> = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(
        products,
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
    );
}
