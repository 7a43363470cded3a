//! Invocation Executor
//!
//! Drives one request through resolve, acquire, send and await, retrying
//! within the policy's budget. Whether a failure is retried depends on where
//! it happened: anything before the first byte was written is safe to repeat,
//! anything after only when the operation is idempotent.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::error::ConnectionError;
use crate::manager::ConnectionManager;
use crate::reference::{InvocationMode, Reference};
use crate::resolver::EndpointResolver;
use crate::retry::RetryPolicy;
use crate::{RemotingError, Result};

/// One request ready to be sent; `body` is already encoded
#[derive(Debug, Clone)]
pub struct Invocation {
    pub reference: Reference,
    pub operation: String,
    pub body: Bytes,
    pub idempotent: bool,
    /// Overrides the executor's default timeout
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(reference: Reference, operation: impl Into<String>, body: Bytes) -> Self {
        Self {
            reference,
            operation: operation.into(),
            body,
            idempotent: false,
            timeout: None,
        }
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Successful outcome of an invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Reply body for twoway requests; `None` once sent or queued otherwise
    pub reply: Option<Bytes>,
    pub retries: u32,
    pub connection: ConnectionId,
}

/// Executor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub invocations: u64,
    pub retries: u64,
    pub failures: u64,
    pub timeouts: u64,
}

/// What to do with a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Fail,
    /// The request may have executed; surface without retrying
    Indeterminate(ConnectionError),
}

/// Retry classification of a failed attempt
pub fn classify(error: &RemotingError, sent: bool, idempotent: bool) -> Decision {
    if !error.is_retryable() {
        return Decision::Fail;
    }
    match error {
        RemotingError::Connection(cause) if sent && !idempotent => Decision::Indeterminate(cause.clone()),
        _ => Decision::Retry,
    }
}

struct AttemptError {
    error: RemotingError,
    sent: bool,
}

impl AttemptError {
    fn before_send(error: RemotingError) -> Self {
        Self { error, sent: false }
    }
}

pub struct InvocationExecutor {
    resolver: Arc<EndpointResolver>,
    manager: Arc<ConnectionManager>,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    cancel: CancellationToken,
    invocations: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl InvocationExecutor {
    pub fn new(
        resolver: Arc<EndpointResolver>,
        manager: Arc<ConnectionManager>,
        retry: RetryPolicy,
        default_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            manager,
            retry,
            default_timeout,
            cancel,
            invocations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run an invocation to completion or a classified failure.
    ///
    /// The timeout covers every attempt including retry waits. On expiry the
    /// outstanding request is abandoned and its connection stays up.
    pub async fn invoke(&self, invocation: &Invocation) -> Result<Completed> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        metrics::counter!("remoting_invocations_total").increment(1);

        let timeout = invocation.timeout.or(self.default_timeout);
        let attempts = async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.run(invocation))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RemotingError::invocation_timeout(
                            invocation.operation.as_str(),
                            timeout.as_millis() as u64,
                        ))
                    }),
                None => self.run(invocation).await,
            }
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(RemotingError::CommunicatorDestroyed),
            result = attempts => result,
        };

        if let Err(error) = &result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            if matches!(error, RemotingError::InvocationTimeout { .. }) {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            #[cfg(feature = "monitoring")]
            metrics::counter!("remoting_invocation_failures_total", "category" => error.category()).increment(1);
            debug!(operation = %invocation.operation, %error, "Invocation failed");
        }
        result
    }

    async fn run(&self, invocation: &Invocation) -> Result<Completed> {
        let mut retries: u32 = 0;
        loop {
            let error = match self.attempt(invocation).await {
                Ok((reply, connection)) => {
                    return Ok(Completed {
                        reply,
                        retries,
                        connection,
                    })
                }
                Err(AttemptError { error, sent }) => match classify(&error, sent, invocation.idempotent) {
                    Decision::Retry => error,
                    Decision::Fail => return Err(error),
                    Decision::Indeterminate(cause) => {
                        warn!(
                            operation = %invocation.operation,
                            %cause,
                            "Non-idempotent request failed after send"
                        );
                        return Err(RemotingError::indeterminate(invocation.operation.as_str(), cause));
                    }
                },
            };

            let Some(interval) = self.retry.interval(retries as usize) else {
                warn!(operation = %invocation.operation, retries, %error, "Retry budget exhausted");
                return Err(error);
            };

            retries += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "monitoring")]
            metrics::counter!("remoting_invocation_retries_total").increment(1);

            self.resolver.invalidate(&invocation.reference);
            info!(
                operation = %invocation.operation,
                retry = retries,
                wait_ms = interval.as_millis() as u64,
                %error,
                "Retrying invocation"
            );
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
    }

    async fn attempt(&self, invocation: &Invocation) -> std::result::Result<(Option<Bytes>, ConnectionId), AttemptError> {
        let connection = self
            .connect(&invocation.reference)
            .await
            .map_err(AttemptError::before_send)?;

        match invocation.reference.mode() {
            InvocationMode::Batch => {
                connection
                    .queue_batch(invocation.body.clone())
                    .map_err(|e| AttemptError::before_send(e.into()))?;
                Ok((None, connection.id()))
            }
            mode => {
                let pending = connection
                    .send_request(invocation.body.clone(), mode.expects_reply())
                    .await
                    .map_err(|e| AttemptError {
                        error: e.error.into(),
                        sent: e.sent,
                    })?;

                match pending {
                    None => Ok((None, connection.id())),
                    Some(pending) => {
                        let request_id = pending.request_id();
                        debug!(connection = %connection.id(), request_id, operation = %invocation.operation, "Awaiting reply");
                        let reply = pending.wait().await.map_err(|e| AttemptError {
                            error: e.into(),
                            sent: true,
                        })?;
                        Ok((Some(reply), connection.id()))
                    }
                }
            }
        }
    }

    /// Resolve the reference and acquire a connection to it
    pub async fn connect(&self, reference: &Reference) -> Result<Arc<Connection>> {
        let resolution = self.resolver.resolve(reference).await?;
        self.manager.acquire(&resolution.endpoints).await
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
