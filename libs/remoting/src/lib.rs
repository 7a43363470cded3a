//! Remoting Runtime
//!
//! Client-side invocation pipeline: references are resolved to endpoints through
//! a location service, endpoints are turned into pooled and validated
//! connections, and requests are sent with an idempotence-aware retry budget and
//! a per-call timeout. Routing intermediaries coalesce outbound traffic per
//! connection through [`BatchRequestRouter`].
//!
//! The wire encoding of payloads ([`Codec`]), the socket pump ([`Connector`]) and
//! the naming service ([`LocationService`]) are collaborators behind traits;
//! [`PassthroughCodec`], [`TcpConnector`] and [`StaticLocator`] make the runtime
//! usable end to end without anything else.
//!
//! ```no_run
//! use remoting::{Communicator, Request};
//!
//! # async fn run() -> remoting::Result<()> {
//! let communicator = Communicator::builder().build()?;
//! let printer = "printer:tcp -h 127.0.0.1 -p 10000".parse()?;
//! let reply = communicator
//!     .invoke(&printer, Request::new("print").params("hello").idempotent(true))
//!     .await?;
//! # let _ = reply;
//! communicator.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod communicator;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod frame;
pub mod location;
pub mod manager;
pub mod reference;
pub mod resolver;
pub mod retry;
pub mod router;
pub mod transports;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use codec::{Codec, DecodedReply, PassthroughCodec, RequestHeader};
pub use communicator::{Communicator, CommunicatorBuilder, Request};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use endpoint::{EndpointDescriptor, EndpointOverrides, EndpointSelection, TransportKind};
pub use error::{ConnectionError, RemotingError, ResolutionError, Result};
pub use executor::{Completed, ExecutorStats, Invocation, InvocationExecutor};
pub use frame::Frame;
pub use location::{LocationService, LocatorError, StaticLocator};
pub use manager::{ConnectionManager, PoolStats};
pub use reference::{Context, EncodingVersion, Identity, InvocationMode, Reference, Target};
pub use resolver::{EndpointResolver, Resolution, ResolverStats};
pub use retry::RetryPolicy;
pub use router::{BatchRequestRouter, RoutedRequest, RouterStats, Submitted};
pub use transports::{tcp::TcpConnector, Connector, Transceiver, TransportError};

pub use remoting_config::RemotingSettings;
