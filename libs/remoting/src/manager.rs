//! Connection Pool
//!
//! Turns candidate endpoints into a live, validated connection. Pooled
//! connections are reused; concurrent callers whose candidate sets intersect
//! share one connect attempt instead of racing.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{EndpointDescriptor, EndpointOverrides};
use crate::error::ConnectionError;
use crate::transports::Connector;
use crate::{RemotingError, Result};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub pending_connects: usize,
    pub connect_attempts: u64,
}

type ConnectOutcome = Option<Result<()>>;

/// A connect attempt other callers can wait on
struct PendingConnect {
    token: u64,
    endpoints: BTreeSet<EndpointDescriptor>,
    outcome: watch::Receiver<ConnectOutcome>,
}

#[derive(Default)]
struct PoolState {
    destroyed: bool,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// Endpoint index; holds ids only
    by_endpoint: BTreeMap<EndpointDescriptor, Vec<ConnectionId>>,
    pending: Vec<PendingConnect>,
}

impl PoolState {
    /// First active pooled connection in candidate order, reaping closed ones on the way
    fn find(&mut self, candidates: &[EndpointDescriptor]) -> Option<Arc<Connection>> {
        for candidate in candidates {
            let Some(ids) = self.by_endpoint.get_mut(candidate) else {
                continue;
            };

            let connections = &mut self.connections;
            ids.retain(|id| match connections.get(id) {
                Some(connection) if connection.is_closed() => {
                    debug!(connection = %id, "Reaping closed connection");
                    connections.remove(id);
                    false
                }
                Some(_) => true,
                None => false,
            });

            let found = ids
                .iter()
                .filter_map(|id| connections.get(id))
                .find(|connection| connection.is_active())
                .cloned();

            if ids.is_empty() {
                self.by_endpoint.remove(candidate);
            }
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn insert(&mut self, connection: Arc<Connection>) {
        self.by_endpoint
            .entry(connection.endpoint().clone())
            .or_default()
            .push(connection.id());
        self.connections.insert(connection.id(), connection);
    }

    fn clear_pending(&mut self, token: u64) {
        self.pending.retain(|pending| pending.token != token);
    }
}

/// Clears the pending marker if the connecting caller is dropped midway
struct PendingGuard<'a> {
    state: &'a Mutex<PoolState>,
    token: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().clear_pending(self.token);
        }
    }
}

enum Step {
    Found(Arc<Connection>),
    Wait(watch::Receiver<ConnectOutcome>),
    Connect(u64, watch::Sender<ConnectOutcome>),
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    overrides: EndpointOverrides,
    connect_timeout: Duration,
    close_grace: Duration,
    state: Mutex<PoolState>,
    next_connection_id: AtomicU64,
    next_token: AtomicU64,
    connect_attempts: AtomicU64,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        overrides: EndpointOverrides,
        connect_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            overrides,
            connect_timeout,
            close_grace: Duration::from_millis(remoting_config::defaults::connection::CLOSE_TIMEOUT_MS),
            state: Mutex::new(PoolState::default()),
            next_connection_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            connect_attempts: AtomicU64::new(0),
            cancel,
        }
    }

    /// How long `destroy` lets outstanding replies drain before aborting
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Get a live connection to one of the endpoints, preferring earlier ones.
    ///
    /// Endpoint overrides are applied first, so the pool is keyed on the
    /// effective endpoint.
    pub async fn acquire(&self, endpoints: &[EndpointDescriptor]) -> Result<Arc<Connection>> {
        let mut candidates: Vec<EndpointDescriptor> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let effective = self.overrides.apply(endpoint);
            if !candidates.contains(&effective) {
                candidates.push(effective);
            }
        }
        if candidates.is_empty() {
            return Err(RemotingError::no_endpoints("empty endpoint list"));
        }

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.destroyed {
                    return Err(RemotingError::ManagerDestroyed);
                }

                if let Some(connection) = state.find(&candidates) {
                    Step::Found(connection)
                } else if let Some(pending) = state
                    .pending
                    .iter()
                    .find(|pending| candidates.iter().any(|c| pending.endpoints.contains(c)))
                {
                    Step::Wait(pending.outcome.clone())
                } else {
                    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    state.pending.push(PendingConnect {
                        token,
                        endpoints: candidates.iter().cloned().collect(),
                        outcome: rx,
                    });
                    Step::Connect(token, tx)
                }
            };

            match step {
                Step::Found(connection) => return Ok(connection),
                Step::Connect(token, tx) => return self.connect_candidates(&candidates, token, tx).await,
                Step::Wait(mut rx) => {
                    debug!("Waiting for pending connect to an intersecting endpoint set");
                    let outcome = tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RemotingError::ManagerDestroyed),
                        outcome = rx.wait_for(Option::is_some) => outcome.map(|outcome| outcome.clone()),
                    };
                    if let Ok(Some(Err(error))) = outcome {
                        return Err(error);
                    }
                    // Success or an abandoned attempt: search the pool again
                }
            }
        }
    }

    async fn connect_candidates(
        &self,
        candidates: &[EndpointDescriptor],
        token: u64,
        tx: watch::Sender<ConnectOutcome>,
    ) -> Result<Arc<Connection>> {
        let mut guard = PendingGuard {
            state: &self.state,
            token,
            armed: true,
        };

        let mut last_error = None;
        for endpoint in candidates {
            match self.connect_one(endpoint).await {
                Ok(connection) => {
                    let registered = {
                        let mut state = self.state.lock();
                        state.clear_pending(token);
                        guard.armed = false;
                        if !state.destroyed {
                            state.insert(connection.clone());
                        }
                        !state.destroyed
                    };

                    if !registered {
                        connection.close_gracefully();
                        let _ = tx.send(Some(Err(RemotingError::ManagerDestroyed)));
                        return Err(RemotingError::ManagerDestroyed);
                    }

                    info!(connection = %connection.id(), endpoint = %endpoint, "Connection established");
                    let _ = tx.send(Some(Ok(())));
                    return Ok(connection);
                }
                Err(error) if error.is_connect_failure() => {
                    warn!(endpoint = %endpoint, %error, "Connect attempt failed");
                    last_error = Some(error);
                }
                // Manager destroyed mid-connect
                Err(error) => {
                    last_error = Some(error);
                    break;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| RemotingError::no_endpoints("empty endpoint list"));
        {
            let mut state = self.state.lock();
            state.clear_pending(token);
            guard.armed = false;
        }
        let _ = tx.send(Some(Err(error.clone())));
        Err(error)
    }

    async fn connect_one(&self, endpoint: &EndpointDescriptor) -> Result<Arc<Connection>> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "monitoring")]
        metrics::counter!("remoting_connect_attempts_total").increment(1);

        let timeout = endpoint.timeout.unwrap_or(self.connect_timeout);
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        debug!(connection = %id, endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Connecting");

        let connect = async {
            let transceiver = match tokio::time::timeout(timeout, self.connector.connect(endpoint, timeout)).await {
                Ok(result) => result.map_err(|e| e.into_connection_error(endpoint))?,
                Err(_) => {
                    return Err(RemotingError::connect_timeout(endpoint, timeout.as_millis() as u64));
                }
            };
            Connection::establish(id, endpoint.clone(), transceiver, timeout)
                .await
                .map_err(RemotingError::from)
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(RemotingError::ManagerDestroyed),
            result = connect => result,
        }
    }

    /// Gracefully close every pooled connection and refuse further acquires.
    ///
    /// Outstanding replies get the close grace period to arrive; connections
    /// still open after it are aborted, failing what they still hold with
    /// `ConnectionError::Lost`. Returns once every connection has closed.
    pub async fn destroy(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.by_endpoint.clear();
            state.connections.drain().map(|(_, connection)| connection).collect()
        };

        self.cancel.cancel();
        info!(connections = connections.len(), "Destroying connection manager");

        for connection in &connections {
            connection.close_gracefully();
        }
        let drained = tokio::time::timeout(
            self.close_grace,
            futures::future::join_all(connections.iter().map(|connection| connection.closed())),
        )
        .await;

        if drained.is_err() {
            for connection in connections.iter().filter(|connection| !connection.is_closed()) {
                warn!(
                    connection = %connection.id(),
                    outstanding = connection.outstanding(),
                    grace_ms = self.close_grace.as_millis() as u64,
                    "Outstanding replies did not drain, aborting"
                );
                connection.abort(ConnectionError::Lost {
                    endpoint: connection.endpoint().to_string(),
                    message: "connection manager destroyed".to_string(),
                });
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Gracefully close active connections that have been idle for at least `idle`
    /// with nothing outstanding; returns how many were closed
    pub fn close_idle(&self, idle: Duration) -> usize {
        let idle_connections: Vec<Arc<Connection>> = self
            .state
            .lock()
            .connections
            .values()
            .filter(|c| c.is_active() && c.outstanding() == 0 && c.batch_len() == 0 && c.idle_for() >= idle)
            .cloned()
            .collect();

        for connection in &idle_connections {
            debug!(connection = %connection.id(), "Closing idle connection");
            connection.close_gracefully();
        }
        idle_connections.len()
    }

    /// Snapshot of the live pooled connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state
            .lock()
            .connections
            .values()
            .filter(|connection| connection.is_active())
            .cloned()
            .collect()
    }

    /// Flush the batch buffer of every pooled connection; returns the number of requests sent
    pub async fn flush_batch_requests(&self) -> usize {
        let mut flushed = 0;
        for connection in self.connections() {
            match connection.flush_batch().await {
                Ok(count) => flushed += count,
                Err(e) => warn!(connection = %connection.id(), error = %e.error, "Batch flush failed"),
            }
        }
        flushed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_connections: state.connections.len(),
            active_connections: state.connections.values().filter(|c| c.is_active()).count(),
            pending_connects: state.pending.len(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodedRequest;
    use crate::endpoint::TransportKind;
    use crate::testing::{Behavior, PeerAction, ScriptedConnector};
    use bytes::Bytes;

    fn manager(connector: Arc<ScriptedConnector>) -> ConnectionManager {
        ConnectionManager::new(
            connector,
            EndpointOverrides::default(),
            Duration::from_millis(200),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_concurrent_acquire_connects_once() {
        let connector = Arc::new(ScriptedConnector::new().with_connect_delay(Duration::from_millis(30)));
        let manager = Arc::new(manager(connector.clone()));
        let endpoints = vec![EndpointDescriptor::tcp("a", 1)];

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                let endpoints = endpoints.clone();
                tokio::spawn(async move { manager.acquire(&endpoints).await })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for task in futures::future::join_all(tasks).await {
            ids.insert(task.unwrap().unwrap().id());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(connector.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_candidates_advance_in_order() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_behavior("a", 1, Behavior::Refuse);
        connector.set_behavior("b", 2, Behavior::Hang);
        let manager = manager(connector.clone());

        let endpoints = vec![
            EndpointDescriptor::tcp("a", 1),
            EndpointDescriptor::tcp("b", 2).with_timeout(Duration::from_millis(30)),
            EndpointDescriptor::tcp("c", 3),
        ];
        let connection = manager.acquire(&endpoints).await.unwrap();
        assert_eq!(connection.endpoint(), &endpoints[2]);
        assert_eq!(connector.total_connects(), 3);
        assert_eq!(manager.stats().connect_attempts, 3);
    }

    #[tokio::test]
    async fn test_unvalidated_session_falls_through() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_behavior("a", 1, Behavior::Silent);
        let manager = manager(connector.clone());

        let endpoints = vec![
            EndpointDescriptor::tcp("a", 1).with_timeout(Duration::from_millis(30)),
            EndpointDescriptor::tcp("b", 2),
        ];
        let connection = manager.acquire(&endpoints).await.unwrap();
        assert_eq!(connection.endpoint(), &endpoints[1]);
        assert_eq!(manager.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_unsupported_transport_is_skipped() {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = manager(connector.clone());
        let ssl = EndpointDescriptor::new(TransportKind::Ssl, "a", 1);

        let connection = manager
            .acquire(&[ssl.clone(), EndpointDescriptor::tcp("b", 2)])
            .await
            .unwrap();
        assert_eq!(connection.endpoint(), &EndpointDescriptor::tcp("b", 2));
        assert_eq!(connector.total_connects(), 2);

        let err = manager
            .acquire(&[ssl, EndpointDescriptor::new(TransportKind::Ssl, "c", 3)])
            .await
            .unwrap_err();
        assert_eq!(err.category(), "unsupported_transport");
        assert_eq!(connector.total_connects(), 4);
    }

    #[tokio::test]
    async fn test_abandoned_connect_is_taken_over() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_behavior("a", 1, Behavior::Hang);
        let manager = Arc::new(manager(connector.clone()));

        // The leader gives up while its connect is still hanging
        let leader = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(30),
                    manager.acquire(&[EndpointDescriptor::tcp("a", 1)]),
                )
                .await
            })
        };
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        connector.set_behavior("a", 1, Behavior::Accept);

        assert!(leader.await.unwrap().is_err());
        let connection = waiter.await.unwrap().unwrap();
        assert!(connection.is_active());
        assert_eq!(connector.total_connects(), 2);
        assert_eq!(manager.stats().pending_connects, 0);
    }

    #[tokio::test]
    async fn test_total_failure_reaches_every_waiter() {
        let connector = Arc::new(
            ScriptedConnector::new().with_connect_delay(Duration::from_millis(30)),
        );
        connector.set_behavior("a", 1, Behavior::Refuse);
        let manager = Arc::new(manager(connector.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            let err = task.unwrap().unwrap_err();
            assert_eq!(err.category(), "connect_refused");
        }
        assert_eq!(connector.total_connects(), 1);
        assert_eq!(manager.stats().pending_connects, 0);
    }

    #[tokio::test]
    async fn test_overrides_key_the_pool() {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = ConnectionManager::new(
            connector.clone(),
            EndpointOverrides {
                timeout: Some(Duration::from_millis(500)),
                compress: Some(true),
            },
            Duration::from_millis(200),
            CancellationToken::new(),
        );

        let raw = EndpointDescriptor::tcp("a", 1);
        let connection = manager.acquire(&[raw.clone()]).await.unwrap();
        assert!(connection.endpoint().compress);
        assert_eq!(connection.endpoint().timeout, Some(Duration::from_millis(500)));

        // Differently configured raw endpoint, same effective endpoint
        let again = manager.acquire(&[raw.with_compress(false)]).await.unwrap();
        assert_eq!(again.id(), connection.id());
        assert_eq!(connector.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_closed_connections_are_reaped() {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = manager(connector.clone());
        let endpoints = [EndpointDescriptor::tcp("a", 1)];

        let first = manager.acquire(&endpoints).await.unwrap();
        first.close_gracefully();
        first.closed().await;

        let second = manager.acquire(&endpoints).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(manager.stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_destroy_fails_future_acquires() {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = manager(connector.clone());
        let connection = manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await.unwrap();

        manager.destroy().await;
        assert!(connection.is_closed());
        assert!(matches!(
            manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await,
            Err(RemotingError::ManagerDestroyed)
        ));
    }

    #[tokio::test]
    async fn test_destroy_aborts_after_close_grace() {
        let connector = Arc::new(
            ScriptedConnector::new().with_handler(Arc::new(|_: &DecodedRequest| PeerAction::Ignore)),
        );
        let manager = manager(connector).with_close_grace(Duration::from_millis(50));
        let connection = manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await.unwrap();

        let pending = connection
            .send_request(Bytes::from_static(b"unanswered"), true)
            .await
            .unwrap()
            .unwrap();
        let waiter = tokio::spawn(pending.wait());

        tokio::time::timeout(Duration::from_secs(2), manager.destroy())
            .await
            .expect("destroy did not finish after the grace period");

        assert!(connection.is_closed());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ConnectionError::Lost { ref message, .. }) if message == "connection manager destroyed"
        ));
    }

    #[tokio::test]
    async fn test_destroy_wakes_waiters() {
        let connector = Arc::new(ScriptedConnector::new());
        connector.set_behavior("a", 1, Behavior::Hang);
        let manager = Arc::new(ConnectionManager::new(
            connector,
            EndpointOverrides::default(),
            Duration::from_secs(30),
            CancellationToken::new(),
        ));

        let leader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await })
        };
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.destroy().await;

        assert!(matches!(leader.await.unwrap(), Err(RemotingError::ManagerDestroyed)));
        assert!(matches!(waiter.await.unwrap(), Err(RemotingError::ManagerDestroyed)));
    }

    #[tokio::test]
    async fn test_close_idle() {
        let connector = Arc::new(ScriptedConnector::new());
        let manager = manager(connector);
        let connection = manager.acquire(&[EndpointDescriptor::tcp("a", 1)]).await.unwrap();

        assert_eq!(manager.close_idle(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.close_idle(Duration::from_millis(10)), 1);
        connection.closed().await;
        assert!(manager.connections().is_empty());
    }
}
