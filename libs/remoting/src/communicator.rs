//! Communicator
//!
//! Entry point wiring the resolver, the connection manager, the invocation
//! executor and batch routers together from [`RemotingSettings`]. Destroying
//! the communicator cancels in-flight invocations and closes the pool.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::codec::{Codec, DecodedReply, PassthroughCodec, RequestHeader};
use crate::connection::Connection;
use crate::endpoint::EndpointOverrides;
use crate::executor::{ExecutorStats, Invocation, InvocationExecutor};
use crate::location::{LocationService, StaticLocator};
use crate::manager::{ConnectionManager, PoolStats};
use crate::reference::{Context, InvocationMode, Reference};
use crate::resolver::{EndpointResolver, ResolverStats};
use crate::retry::RetryPolicy;
use crate::router::BatchRequestRouter;
use crate::transports::tcp::TcpConnector;
use crate::transports::Connector;
use crate::{RemotingError, Result};
use remoting_config::RemotingSettings;

/// A request to invoke on a reference
#[derive(Debug, Clone)]
pub struct Request {
    operation: String,
    params: Bytes,
    idempotent: bool,
    context: Option<Context>,
    timeout: Option<Duration>,
    mode: Option<InvocationMode>,
}

impl Request {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: Bytes::new(),
            idempotent: false,
            context: None,
            timeout: None,
            mode: None,
        }
    }

    /// Marshaled in parameters
    pub fn params(mut self, params: impl Into<Bytes>) -> Self {
        self.params = params.into();
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Replaces the reference's context for this call
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the reference's invocation mode for this call
    pub fn mode(mut self, mode: InvocationMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Default)]
pub struct CommunicatorBuilder {
    settings: RemotingSettings,
    locator: Option<Arc<dyn LocationService>>,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
}

impl CommunicatorBuilder {
    pub fn settings(mut self, settings: RemotingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults to a [`StaticLocator`] built from the locator settings
    pub fn locator(mut self, locator: Arc<dyn LocationService>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Defaults to [`TcpConnector`]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Defaults to [`PassthroughCodec`]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<Communicator> {
        let settings = self.settings;
        settings
            .validate()
            .map_err(|e| RemotingError::configuration(format!("{:#}", e), None))?;

        let locator = match self.locator {
            Some(locator) => locator,
            None => Arc::new(StaticLocator::from_settings(&settings.locator)?),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(settings.connection.max_message_size)));
        let codec = self.codec.unwrap_or_else(|| Arc::new(PassthroughCodec));

        let cancel = CancellationToken::new();
        let resolver = Arc::new(EndpointResolver::new(
            locator,
            settings.locator.timeout(),
            settings.locator.cache_timeout(),
        ));
        let manager = Arc::new(ConnectionManager::new(
            connector,
            EndpointOverrides {
                timeout: settings.connection.override_timeout(),
                compress: settings.connection.override_compress,
            },
            settings.connection.connect_timeout(),
            cancel.child_token(),
        )
        .with_close_grace(settings.connection.close_timeout()));
        let executor = Arc::new(InvocationExecutor::new(
            resolver,
            manager,
            RetryPolicy::from_settings(&settings.invocation),
            settings.invocation.timeout(),
            cancel.clone(),
        ));

        info!(
            retry_intervals = ?settings.invocation.retry_intervals_ms,
            buffered_routers = settings.router.buffered,
            "Communicator initialized"
        );

        Ok(Communicator {
            settings,
            codec,
            executor,
            cancel,
        })
    }
}

pub struct Communicator {
    settings: RemotingSettings,
    codec: Arc<dyn Codec>,
    executor: Arc<InvocationExecutor>,
    cancel: CancellationToken,
}

impl Communicator {
    pub fn builder() -> CommunicatorBuilder {
        CommunicatorBuilder::default()
    }

    pub fn settings(&self) -> &RemotingSettings {
        &self.settings
    }

    /// Invoke an operation; returns the out parameters, or an empty body for
    /// requests that expect no reply
    pub async fn invoke(&self, reference: &Reference, request: Request) -> Result<Bytes> {
        if self.is_destroyed() {
            return Err(RemotingError::CommunicatorDestroyed);
        }

        let reference = match request.mode {
            Some(mode) if mode != reference.mode() => reference.with_mode(mode),
            _ => reference.clone(),
        };
        let context = request.context.as_ref().unwrap_or_else(|| reference.context());

        let header = RequestHeader {
            identity: reference.identity(),
            facet: reference.facet(),
            operation: &request.operation,
            mode: reference.mode(),
            idempotent: request.idempotent,
            encoding: reference.encoding(),
            context,
        };
        let body = self.codec.encode_request(&header, &request.params)?;

        let mut invocation = Invocation::new(reference, request.operation, body).idempotent(request.idempotent);
        invocation.timeout = request.timeout;

        let completed = self.executor.invoke(&invocation).await?;
        match completed.reply {
            None => Ok(Bytes::new()),
            Some(reply) => match self.codec.decode_reply(reply)? {
                DecodedReply::Ok(out) => Ok(out),
                DecodedReply::Exception(payload) => Err(RemotingError::application(invocation.operation, payload)),
            },
        }
    }

    /// The pooled connection requests on `reference` would use
    pub async fn connection(&self, reference: &Reference) -> Result<Arc<Connection>> {
        if self.is_destroyed() {
            return Err(RemotingError::CommunicatorDestroyed);
        }
        self.executor.connect(reference).await
    }

    /// Router for requests arriving on `connection`, configured from the router settings
    pub fn create_batch_router(&self, connection: &Connection) -> BatchRequestRouter {
        BatchRequestRouter::new(
            connection,
            self.executor.clone(),
            self.settings.router.buffered,
            self.settings.router.sleep_time(),
            self.cancel.child_token(),
        )
    }

    /// Flush batch buffers on every pooled connection
    pub async fn flush_batch_requests(&self) -> usize {
        self.executor.manager().flush_batch_requests().await
    }

    /// Close connections idle for longer than the configured idle timeout
    pub fn close_idle_connections(&self) -> usize {
        match self.settings.connection.idle_timeout() {
            Some(idle) => self.executor.manager().close_idle(idle),
            None => 0,
        }
    }

    pub fn executor(&self) -> &Arc<InvocationExecutor> {
        &self.executor
    }

    pub fn resolver_stats(&self) -> ResolverStats {
        self.executor.resolver().stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.executor.manager().stats()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel in-flight invocations and close every pooled connection
    pub async fn destroy(&self) {
        if !self.is_destroyed() {
            info!("Destroying communicator");
        }
        self.cancel.cancel();
        self.executor.manager().destroy().await;
    }
}
