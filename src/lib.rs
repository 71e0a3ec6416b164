pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod router;
pub mod transport;
pub mod worker;

pub use error::{RouterError, RouterResult};
pub use router::protocol::{CorrelationId, ReplyAddress, RequestEnvelope};
pub use router::{
    Call, CallOutcome, CallTimeout, EphemeralDispatcher, ReplyRouter, RequestDispatcher,
};
pub use transport::memory::MemoryBroker;
pub use transport::{Transport, TransportError};
