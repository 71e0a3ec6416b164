//! Request and reply envelopes.
//!
//! The envelope is the JSON body of a broker message. The correlation id and
//! reply address are duplicated into the message properties by
//! [`RequestEnvelope::to_message`] so a consumer can route without decoding.

use serde::{Deserialize, Serialize};

use super::{CorrelationId, ReplyAddress};
use crate::transport::Message;

/// Outbound request: who to answer, where, and what was asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope<P> {
    pub correlation_id: CorrelationId,
    pub reply_to: ReplyAddress,
    /// Order services publishing the older event shape send this as `order`.
    #[serde(alias = "order")]
    pub payload: P,
}

impl<P: Serialize> RequestEnvelope<P> {
    /// Encode into a broker message carrying correlation id and reply address.
    pub fn to_message(&self) -> serde_json::Result<Message> {
        let body = serde_json::to_vec(self)?;
        Ok(Message::json(
            body,
            Some(self.correlation_id.clone()),
            Some(self.reply_to.clone()),
        ))
    }
}

impl<P: for<'de> Deserialize<'de>> RequestEnvelope<P> {
    /// Decode a request from a delivered message body.
    pub fn from_message(message: &Message) -> serde_json::Result<Self> {
        serde_json::from_slice(&message.body)
    }
}

/// Correlation id of a reply, from the message property or the body.
pub(crate) fn reply_correlation_id(message: &Message) -> Option<CorrelationId> {
    message
        .correlation_id
        .clone()
        .or_else(|| CorrelationId::from_json_body(&message.body))
}
