//! Error handling types for reply-router
//!
//! This module provides the error types shared by the registry, the
//! dispatcher and the process bootstrap.

use std::sync::PoisonError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::router::protocol::CorrelationId;
use crate::transport::TransportError;

/// Error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// A slot for this correlation id is already live
    #[error("Duplicate correlation id: {id}")]
    DuplicateCorrelationId { id: CorrelationId },

    /// The reply consumer has stopped; no reply can ever arrive
    #[error("Correlation registry closed: {reason}")]
    RegistryClosed { reason: String },

    /// Broker operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Helper trait to recover a guard from a poisoned lock
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging the operation that hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "reply_router::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

impl RouterError {
    /// Create a registry closed error
    pub fn registry_closed(reason: impl Into<String>) -> Self {
        RouterError::RegistryClosed {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn duplicate_id_message_names_the_id() {
        let id = CorrelationId::from("abc");
        let err = RouterError::DuplicateCorrelationId { id };
        assert_eq!(err.to_string(), "Duplicate correlation id: abc");
    }

    #[test]
    fn transport_error_converts() {
        let err: RouterError = TransportError::ConnectionClosed.into();
        assert!(matches!(err, RouterError::Transport(_)));
    }

    #[test]
    fn config_error_is_reported_without_rewrapping() {
        let err: RouterError = ConfigError::Invalid("request_queue must not be empty".to_string()).into();
        assert!(matches!(err, RouterError::Config(ConfigError::Invalid(_))));
        assert_eq!(
            err.to_string(),
            "invalid configuration: request_queue must not be empty"
        );
    }

    #[test]
    fn recover_poison_returns_inner_guard() {
        let lock = Arc::new(Mutex::new(7));
        let clone = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = lock.lock().recover_poison("test");
        assert_eq!(*guard, 7);
    }
}
