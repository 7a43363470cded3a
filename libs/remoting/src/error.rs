//! Remoting Error Types
//!
//! Classified failures for reference resolution, connection management and
//! invocation. Every fallible operation in the crate returns [`RemotingError`],
//! so retry decisions are a match over the variant rather than a guess from a
//! message string.

use bytes::Bytes;
use thiserror::Error;

/// Failures while turning a reference into endpoints
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The location service does not know the adapter id
    #[error("object adapter '{adapter}' is not registered")]
    AdapterNotRegistered { adapter: String },

    /// The location service does not know the well-known object
    #[error("object '{identity}' is not registered")]
    ObjectNotRegistered { identity: String },

    /// The location service could not be reached or timed out
    #[error("location service unreachable: {message}")]
    Unreachable { message: String },

    /// Resolution succeeded but produced nothing to connect to
    #[error("no endpoints available for '{target}'")]
    NoEndpoints { target: String },
}

/// Failures establishing or using a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection to {endpoint} refused: {message}")]
    Refused { endpoint: String, message: String },

    #[error("connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("connection to {endpoint} lost: {message}")]
    Lost { endpoint: String, message: String },

    /// The session broke protocol; it is torn down like a lost connection
    #[error("protocol violation on {endpoint}: {message}")]
    ProtocolViolation { endpoint: String, message: String },

    /// Rejected locally before any byte was written
    #[error("frame of {size} bytes for {endpoint} exceeds the {max} byte limit")]
    FrameTooLarge { endpoint: String, size: usize, max: usize },

    #[error("transport '{transport}' is not supported")]
    Unsupported { transport: String },
}

/// Main error type for the invocation pipeline
#[derive(Error, Debug, Clone)]
pub enum RemotingError {
    /// Reference resolution errors
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Connection establishment and transport errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The invocation timeout elapsed before a reply arrived
    #[error("Invocation timeout: '{operation}' exceeded {timeout_ms}ms")]
    InvocationTimeout { operation: String, timeout_ms: u64 },

    /// A non-idempotent request may or may not have executed on the peer
    #[error("Indeterminate outcome for '{operation}': {cause}")]
    IndeterminateOutcome {
        operation: String,
        cause: ConnectionError,
    },

    /// The remote object raised an exception; the payload is the encoded exception
    #[error("Application exception from '{operation}' ({} bytes)", .payload.len())]
    Application { operation: String, payload: Bytes },

    /// Malformed frames or payloads detected locally
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Invalid settings or references
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    #[error("Connection manager destroyed")]
    ManagerDestroyed,

    #[error("Request queue destroyed")]
    QueueDestroyed,

    #[error("Communicator destroyed")]
    CommunicatorDestroyed,
}

/// Result type alias for remoting operations
pub type Result<T> = std::result::Result<T, RemotingError>;

impl RemotingError {
    /// Create an adapter-not-registered error
    pub fn adapter_not_registered(adapter: impl Into<String>) -> Self {
        ResolutionError::AdapterNotRegistered {
            adapter: adapter.into(),
        }
        .into()
    }

    /// Create an object-not-registered error
    pub fn object_not_registered(identity: impl Into<String>) -> Self {
        ResolutionError::ObjectNotRegistered {
            identity: identity.into(),
        }
        .into()
    }

    /// Create a location-service-unreachable error
    pub fn locator_unreachable(message: impl Into<String>) -> Self {
        ResolutionError::Unreachable {
            message: message.into(),
        }
        .into()
    }

    /// Create a no-endpoints error
    pub fn no_endpoints(target: impl Into<String>) -> Self {
        ResolutionError::NoEndpoints {
            target: target.into(),
        }
        .into()
    }

    /// Create a connection refused error
    pub fn connect_refused(endpoint: impl ToString, message: impl Into<String>) -> Self {
        ConnectionError::Refused {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
        .into()
    }

    /// Create a connect timeout error
    pub fn connect_timeout(endpoint: impl ToString, timeout_ms: u64) -> Self {
        ConnectionError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout_ms,
        }
        .into()
    }

    /// Create a connection lost error
    pub fn connection_lost(endpoint: impl ToString, message: impl Into<String>) -> Self {
        ConnectionError::Lost {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
        .into()
    }

    /// Create an invocation timeout error
    pub fn invocation_timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::InvocationTimeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an indeterminate outcome error
    pub fn indeterminate(operation: impl Into<String>, cause: ConnectionError) -> Self {
        Self::IndeterminateOutcome {
            operation: operation.into(),
            cause,
        }
    }

    /// Create an application exception error
    pub fn application(operation: impl Into<String>, payload: Bytes) -> Self {
        Self::Application {
            operation: operation.into(),
            payload,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Check if this error is transient and may succeed on another attempt.
    ///
    /// This is the coarse split only; whether an invocation actually retries
    /// also depends on whether the request was sent and on idempotence.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemotingError::Resolution(ResolutionError::Unreachable { .. }) => true,
            RemotingError::Resolution(_) => false,
            RemotingError::Connection(ConnectionError::Refused { .. }) => true,
            RemotingError::Connection(ConnectionError::ConnectTimeout { .. }) => true,
            RemotingError::Connection(ConnectionError::Lost { .. }) => true,
            RemotingError::Connection(ConnectionError::ProtocolViolation { .. }) => true,
            RemotingError::Connection(ConnectionError::Unsupported { .. }) => false,
            RemotingError::Connection(ConnectionError::FrameTooLarge { .. }) => false,
            RemotingError::InvocationTimeout { .. } => false,
            RemotingError::IndeterminateOutcome { .. } => false,
            RemotingError::Application { .. } => false,
            RemotingError::Protocol { .. } => false,
            RemotingError::Configuration { .. } => false,
            RemotingError::ManagerDestroyed => false,
            RemotingError::QueueDestroyed => false,
            RemotingError::CommunicatorDestroyed => false,
        }
    }

    /// Check if this failure advances connection establishment to the next candidate.
    ///
    /// Unsupported transports are skipped so mixed endpoint lists still reach
    /// a usable candidate.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            RemotingError::Connection(
                ConnectionError::Refused { .. }
                    | ConnectionError::ConnectTimeout { .. }
                    | ConnectionError::Lost { .. }
                    | ConnectionError::ProtocolViolation { .. }
                    | ConnectionError::Unsupported { .. }
            )
        )
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            RemotingError::Resolution(ResolutionError::AdapterNotRegistered { .. }) => "not_registered",
            RemotingError::Resolution(ResolutionError::ObjectNotRegistered { .. }) => "not_registered",
            RemotingError::Resolution(ResolutionError::Unreachable { .. }) => "locator_unreachable",
            RemotingError::Resolution(ResolutionError::NoEndpoints { .. }) => "no_endpoints",
            RemotingError::Connection(ConnectionError::Refused { .. }) => "connect_refused",
            RemotingError::Connection(ConnectionError::ConnectTimeout { .. }) => "connect_timeout",
            RemotingError::Connection(ConnectionError::Lost { .. }) => "connection_lost",
            RemotingError::Connection(ConnectionError::ProtocolViolation { .. }) => "protocol_violation",
            RemotingError::Connection(ConnectionError::Unsupported { .. }) => "unsupported_transport",
            RemotingError::Connection(ConnectionError::FrameTooLarge { .. }) => "frame_too_large",
            RemotingError::InvocationTimeout { .. } => "invocation_timeout",
            RemotingError::IndeterminateOutcome { .. } => "indeterminate_outcome",
            RemotingError::Application { .. } => "application",
            RemotingError::Protocol { .. } => "protocol",
            RemotingError::Configuration { .. } => "configuration",
            RemotingError::ManagerDestroyed => "manager_destroyed",
            RemotingError::QueueDestroyed => "queue_destroyed",
            RemotingError::CommunicatorDestroyed => "communicator_destroyed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let err = RemotingError::connect_refused("tcp -h localhost -p 4061", "Connection refused");
        assert_eq!(err.category(), "connect_refused");
        assert!(err.is_retryable());
        assert!(err.is_connect_failure());
        assert!(err.to_string().contains("tcp -h localhost -p 4061"));
    }

    #[test]
    fn test_resolution_errors() {
        let not_registered = RemotingError::adapter_not_registered("PrinterAdapter");
        assert!(!not_registered.is_retryable());
        assert_eq!(not_registered.category(), "not_registered");

        let unreachable = RemotingError::locator_unreachable("registry down");
        assert!(unreachable.is_retryable());
        assert!(!unreachable.is_connect_failure());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(!RemotingError::invocation_timeout("ping", 100).is_retryable());
        assert!(!RemotingError::application("ping", Bytes::from_static(b"boom")).is_retryable());
        assert!(!RemotingError::ManagerDestroyed.is_retryable());

        let cause = ConnectionError::Lost {
            endpoint: "tcp -h a -p 1".to_string(),
            message: "reset".to_string(),
        };
        let err = RemotingError::indeterminate("transfer", cause.clone());
        assert!(!err.is_retryable());
        match err {
            RemotingError::IndeterminateOutcome { operation, cause: c } => {
                assert_eq!(operation, "transfer");
                assert_eq!(c, cause);
            }
            _ => panic!("Expected IndeterminateOutcome"),
        }
    }

    #[test]
    fn test_session_errors_are_transient_but_local_rejections_are_not() {
        let violation = RemotingError::from(ConnectionError::ProtocolViolation {
            endpoint: "tcp -h a -p 1".to_string(),
            message: "unexpected batch_request frame from server".to_string(),
        });
        assert!(violation.is_retryable());
        assert_eq!(violation.category(), "protocol_violation");

        let too_large = RemotingError::from(ConnectionError::FrameTooLarge {
            endpoint: "tcp -h a -p 1".to_string(),
            size: 4096,
            max: 1024,
        });
        assert!(!too_large.is_retryable());
        assert!(!too_large.is_connect_failure());
        assert_eq!(too_large.category(), "frame_too_large");

        let unsupported = RemotingError::from(ConnectionError::Unsupported {
            transport: "ssl".to_string(),
        });
        assert!(!unsupported.is_retryable());
        assert!(unsupported.is_connect_failure());
    }

    #[test]
    fn test_configuration_error_field() {
        let err = RemotingError::configuration("bad endpoint", Some("locator.adapters"));
        match err {
            RemotingError::Configuration { field, .. } => {
                assert_eq!(field.as_deref(), Some("locator.adapters"));
            }
            _ => panic!("Expected Configuration error"),
        }
    }

    #[test]
    fn test_errors_are_cloneable_for_shared_waiters() {
        let err = RemotingError::connect_timeout("tcp -h a -p 1", 250);
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
