//! Correlated request/reply over an asynchronous broker.
//!
//! # Architecture
//!
//! ```text
//! caller ──call()──> RequestDispatcher ──publish──> Transport ──> worker
//!                          │ register/remove                        │
//!                          ▼                                        ▼
//!                  CorrelationRegistry <──complete── ReplyConsumer <── reply channel
//! ```
//!
//! One reply channel and one consumer task serve every outstanding call of
//! the process. [`ReplyRouter::start`] wires the pieces together.
//!
//! [`EphemeralDispatcher`] is the alternative strategy: one reply channel per
//! call, no registry.

pub mod actor;
pub mod protocol;

mod call_timeout;
mod dispatcher;
mod ephemeral;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::RouterResult;
use crate::transport::Transport;
use actor::{ConsumerExit, CorrelationRegistry, ReplyConsumerHandle, spawn_reply_consumer};

pub use call_timeout::CallTimeout;
pub use dispatcher::RequestDispatcher;
pub use ephemeral::EphemeralDispatcher;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<R> {
    /// The matching reply arrived in time.
    Replied(R),
    /// No reply before the deadline.
    TimedOut,
    /// The caller gave up first.
    Cancelled,
    /// The request never reached the broker.
    PublishFailed(String),
    /// The reply path is gone; no reply can arrive.
    TransportAbandoned(String),
}

impl<R> CallOutcome<R> {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Replied(_) => "replied",
            CallOutcome::TimedOut => "timed out",
            CallOutcome::Cancelled => "cancelled",
            CallOutcome::PublishFailed(_) => "publish failed",
            CallOutcome::TransportAbandoned(_) => "transport abandoned",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(R) -> U) -> CallOutcome<U> {
        match self {
            CallOutcome::Replied(reply) => CallOutcome::Replied(f(reply)),
            CallOutcome::TimedOut => CallOutcome::TimedOut,
            CallOutcome::Cancelled => CallOutcome::Cancelled,
            CallOutcome::PublishFailed(reason) => CallOutcome::PublishFailed(reason),
            CallOutcome::TransportAbandoned(reason) => CallOutcome::TransportAbandoned(reason),
        }
    }
}

/// A synchronous-looking request/reply call.
///
/// Implemented by both reply strategies so callers can hold either behind
/// `Arc<dyn Call<P, R>>`.
#[async_trait]
pub trait Call<P, R>: Send + Sync
where
    P: Serialize + Sync,
{
    async fn call(&self, payload: &P, timeout: Duration, cancel: &CancellationToken) -> CallOutcome<R>;
}

/// Shared reply channel, its consumer, and a dispatcher bound to both.
pub struct ReplyRouter<T, R> {
    dispatcher: RequestDispatcher<T, R>,
    consumer: ReplyConsumerHandle,
}

impl<T, R> ReplyRouter<T, R>
where
    T: Transport,
    R: DeserializeOwned + Send + 'static,
{
    /// Declare the reply channel, start its consumer, and build a dispatcher
    /// publishing requests to `destination`.
    pub async fn start(transport: Arc<T>, destination: impl Into<String>) -> RouterResult<Self> {
        let reply_address = transport.declare_reply_channel().await?;
        let subscription = transport.consume(reply_address.as_str()).await?;
        let registry = Arc::new(CorrelationRegistry::new());
        let consumer =
            spawn_reply_consumer(Arc::clone(&transport), subscription, Arc::clone(&registry));

        info!(
            target: "reply_router::dispatcher",
            "Reply router listening on {}",
            reply_address
        );

        Ok(Self {
            dispatcher: RequestDispatcher::new(transport, registry, reply_address, destination),
            consumer,
        })
    }

    pub fn dispatcher(&self) -> &RequestDispatcher<T, R> {
        &self.dispatcher
    }

    /// Stop the consumer; calls still waiting are abandoned.
    pub async fn shutdown(self) -> ConsumerExit {
        self.consumer.shutdown().await
    }
}
