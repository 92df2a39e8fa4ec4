//! Request/response types flowing through the dispatch stack, and the
//! error taxonomy of the runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use microbus_core::{Endpoint, ErrorDescriptor, Headers, Message, TransportError};

/// Error codes used on the wire for runtime-generated failures.
pub mod error_codes {
    pub const BAD_REQUEST: &str = "400";
    pub const INTERNAL: &str = "500";
    pub const OVERLOADED: &str = "503";
    pub const TIMEOUT: &str = "504";
}

/// A delivered message tagged with the endpoint whose subscription received it.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub endpoint: Arc<Endpoint>,
    pub message: Message,
}

/// Terminal result of one dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply { payload: Bytes, headers: Headers },
    Error { error: ErrorDescriptor, headers: Headers },
    /// The pipeline chose not to answer.
    Suppressed,
}

impl Outcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Successful response of the dispatch stack.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub method: String,
    pub outcome: Outcome,
}

/// Failures raised by the dispatch stack itself rather than by handlers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No live route for the subject; expected while stopping.
    #[error("no route for subject {subject}")]
    RoutingMiss { subject: String },
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("service overloaded, try again later")]
    Overloaded,
}

impl DispatchError {
    /// Wire error for this failure. Routing misses have none: nobody owns the reply.
    #[must_use]
    pub fn descriptor(&self) -> Option<ErrorDescriptor> {
        match self {
            Self::RoutingMiss { .. } => None,
            Self::Timeout { .. } => Some(ErrorDescriptor::new(
                error_codes::TIMEOUT,
                self.to_string(),
            )),
            Self::Overloaded => Some(ErrorDescriptor::new(
                error_codes::OVERLOADED,
                self.to_string(),
            )),
        }
    }
}

/// Boxed future returned by every dispatch-stack service.
pub type DispatchFuture =
    Pin<Box<dyn Future<Output = Result<DispatchResponse, DispatchError>> + Send>>;

/// Build-time failures of a microservice definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("invalid service name {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidServiceName(String),
    #[error("invalid method name {0:?}")]
    InvalidMethodName(String),
    #[error("method {0} is already registered")]
    DuplicateMethod(String),
    #[error("method {0} has no handler")]
    MissingHandler(String),
    #[error("invalid subject {subject:?} for method {method}")]
    InvalidSubject { method: String, subject: String },
    #[error("invalid balancing for method {method}: {reason}")]
    InvalidBalancing { method: String, reason: &'static str },
    #[error("methods {first} and {second} both resolve to subject {subject}")]
    SubjectCollision {
        first: String,
        second: String,
        subject: String,
    },
}

/// Failure to bring a microservice up. Partial subscriptions are rolled back.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to subscribe to {subject}")]
    Subscribe {
        subject: String,
        #[source]
        source: TransportError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_miss_has_no_wire_error() {
        let err = DispatchError::RoutingMiss {
            subject: "a.b".to_string(),
        };
        assert!(err.descriptor().is_none());
    }

    #[test]
    fn timeout_and_overload_map_to_codes() {
        let timeout = DispatchError::Timeout { timeout_ms: 10 }.descriptor().unwrap();
        assert_eq!(timeout.code, error_codes::TIMEOUT);
        assert_eq!(timeout.message, "request timed out after 10ms");
        let overloaded = DispatchError::Overloaded.descriptor().unwrap();
        assert_eq!(overloaded.code, error_codes::OVERLOADED);
    }
}
