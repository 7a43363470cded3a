//! Transport Layer
//!
//! The runtime talks to the network through two traits: a [`Connector`] opens
//! a session to an endpoint and a [`Transceiver`] moves whole frames over it.
//! Sending and receiving happen concurrently, so both take `&self`.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::EndpointDescriptor;
use crate::error::ConnectionError;

pub mod tcp;

/// Transport-level failure, without endpoint context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {message}")]
    ConnectRefused { message: String },

    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("transport '{transport}' is not supported")]
    Unsupported { transport: String },

    /// Outgoing frame over the size limit; nothing was written
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Attach the endpoint the failure happened on.
    ///
    /// An I/O timeout on an established session leaves the stream in an
    /// unknown state, so it is reported as a lost connection.
    pub fn into_connection_error(self, endpoint: &EndpointDescriptor) -> ConnectionError {
        let endpoint = endpoint.to_string();
        match self {
            TransportError::ConnectRefused { message } => ConnectionError::Refused { endpoint, message },
            TransportError::ConnectTimeout { timeout_ms } => {
                ConnectionError::ConnectTimeout { endpoint, timeout_ms }
            }
            TransportError::ConnectionLost { message } => ConnectionError::Lost { endpoint, message },
            TransportError::Timeout { .. } => ConnectionError::Lost {
                endpoint,
                message: self.to_string(),
            },
            TransportError::ProtocolViolation { message } => {
                ConnectionError::ProtocolViolation { endpoint, message }
            }
            TransportError::Unsupported { transport } => ConnectionError::Unsupported { transport },
            TransportError::FrameTooLarge { size, max } => ConnectionError::FrameTooLarge { endpoint, size, max },
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::ConnectRefused {
                message: error.to_string(),
            },
            io::ErrorKind::TimedOut => TransportError::Timeout {
                operation: "socket".to_string(),
                timeout_ms: 0,
            },
            io::ErrorKind::InvalidData => TransportError::protocol(error.to_string()),
            _ => TransportError::connection_lost(error.to_string()),
        }
    }
}

/// An established session moving whole frames
#[async_trait]
pub trait Transceiver: Send + Sync + 'static {
    /// Transport-level handshake; completes before the connection is validated
    async fn initialize(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()>;

    async fn recv(&self) -> TransportResult<Bytes>;

    /// Release the session; further sends and receives fail
    async fn close(&self);
}

/// Opens sessions to endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> TransportResult<Arc<dyn Transceiver>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_transport_kinds() {
        let refused: TransportError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(refused, TransportError::ConnectRefused { .. }));

        let reset: TransportError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, TransportError::ConnectionLost { .. }));

        let eof: TransportError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(eof, TransportError::ConnectionLost { .. }));
    }

    #[test]
    fn test_connection_error_carries_endpoint() {
        let endpoint = EndpointDescriptor::tcp("db", 5432);
        let err = TransportError::ConnectTimeout { timeout_ms: 250 }.into_connection_error(&endpoint);
        assert_eq!(
            err,
            ConnectionError::ConnectTimeout {
                endpoint: "tcp -h db -p 5432".to_string(),
                timeout_ms: 250,
            }
        );

        let io_timeout = TransportError::timeout("recv", Duration::from_secs(1)).into_connection_error(&endpoint);
        assert!(matches!(io_timeout, ConnectionError::Lost { .. }));
    }
}
