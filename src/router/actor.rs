//! Actor components for the shared reply channel.
//!
//! # Components
//!
//! - `CorrelationRegistry`: Maps correlation ids to single-use reply slots
//! - `ReplyConsumer`: Background task that drains the reply channel and
//!   completes slots

mod correlation_registry;
mod reply_consumer;

pub use correlation_registry::{
    Completion, CorrelationRegistry, ReplySlot, SlotOutcome, SlotState,
};
pub use reply_consumer::{ConsumerExit, ReplyConsumerHandle, spawn_reply_consumer};
