//! Wire-level types for correlated request/reply.

mod correlation_id;
mod envelope;

pub use correlation_id::{CorrelationId, ReplyAddress};
pub(crate) use envelope::reply_correlation_id;
pub use envelope::RequestEnvelope;
