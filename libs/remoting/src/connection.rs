//! Pooled connection with request correlation.
//!
//! A connection owns one transceiver and the table of requests still waiting
//! for a reply. A reader task demultiplexes replies by correlation id; whoever
//! removes an entry from the table is the one that completes it, so every
//! pending request resolves exactly once: by its reply, by connection loss, or
//! by being abandoned when the caller gives up.
//!
//! State only moves forward: Validating -> Active -> Closing -> Closed.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointDescriptor;
use crate::error::ConnectionError;
use crate::frame::{Frame, NO_REPLY_ID};
use crate::transports::{Transceiver, TransportError};

/// Stable identifier assigned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Validating = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Validating,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A failed write, and whether any bytes may have reached the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    pub error: ConnectionError,
    pub sent: bool,
}

impl SendError {
    fn not_sent(error: ConnectionError) -> Self {
        Self { error, sent: false }
    }
}

type ReplySender = oneshot::Sender<Result<Bytes, ConnectionError>>;

struct PendingRequest {
    sender: ReplySender,
    sent_at: Instant,
}

pub struct Connection {
    id: ConnectionId,
    endpoint: EndpointDescriptor,
    transceiver: Arc<dyn Transceiver>,
    state: AtomicU8,
    outstanding: DashMap<u32, PendingRequest>,
    next_request_id: AtomicU32,
    /// Serializes writes so frames go out in submission order
    write_lock: tokio::sync::Mutex<()>,
    batch: Mutex<Vec<Bytes>>,
    last_activity: Mutex<Instant>,
    close_reason: Mutex<Option<ConnectionError>>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Run the transport handshake and wait for the peer to validate the session.
    ///
    /// Datagram endpoints have no validation step. The returned connection is
    /// Active and its reader task is running.
    pub async fn establish(
        id: ConnectionId,
        endpoint: EndpointDescriptor,
        transceiver: Arc<dyn Transceiver>,
        validate_timeout: Duration,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let connection = Arc::new(Connection {
            id,
            endpoint,
            transceiver,
            state: AtomicU8::new(ConnectionState::Validating as u8),
            outstanding: DashMap::new(),
            next_request_id: AtomicU32::new(1),
            write_lock: tokio::sync::Mutex::new(()),
            batch: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        if let Err(error) = connection.validate(validate_timeout).await {
            connection.advance(ConnectionState::Closed);
            connection.transceiver.close().await;
            return Err(error);
        }

        connection.advance(ConnectionState::Active);
        tokio::spawn(connection.clone().run_reader());

        debug!(connection = %id, endpoint = %connection.endpoint, "Connection validated");
        Ok(connection)
    }

    async fn validate(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let handshake = async {
            self.transceiver.initialize().await?;
            if self.endpoint.transport.is_datagram() {
                return Ok::<(), TransportError>(());
            }

            let frame = self.transceiver.recv().await?;
            match Frame::decode(frame) {
                Ok(Frame::ValidateConnection) => Ok(()),
                Ok(other) => Err(TransportError::protocol(format!(
                    "expected validate_connection, received {}",
                    other.kind_name()
                ))),
                Err(e) => Err(TransportError::protocol(e.to_string())),
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result.map_err(|e| e.into_connection_error(&self.endpoint)),
            Err(_) => Err(ConnectionError::ConnectTimeout {
                endpoint: self.endpoint.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Requests queued in the batch buffer and not yet flushed
    pub fn batch_len(&self) -> usize {
        self.batch.lock().len()
    }

    /// Why the connection closed, if it closed on an error
    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.close_reason.lock().clone()
    }

    /// Resolves once the connection reaches Closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Send one request frame. A twoway request gets a correlation id and a
    /// handle to await the reply; dropping the handle abandons the request.
    pub async fn send_request(
        self: &Arc<Self>,
        body: Bytes,
        expects_reply: bool,
    ) -> Result<Option<PendingReply>, SendError> {
        self.ensure_usable().map_err(SendError::not_sent)?;

        let pending = expects_reply.then(|| self.register());
        let request_id = pending.as_ref().map_or(NO_REPLY_ID, |p| p.request_id);

        self.write(Frame::Request { request_id, body }.encode()).await?;
        Ok(pending)
    }

    /// Append a request body to the batch buffer
    pub fn queue_batch(&self, body: Bytes) -> Result<(), ConnectionError> {
        self.ensure_usable()?;
        self.batch.lock().push(body);
        Ok(())
    }

    /// Send everything in the batch buffer as one frame; returns the number of requests sent
    pub async fn flush_batch(&self) -> Result<usize, SendError> {
        let requests = std::mem::take(&mut *self.batch.lock());
        if requests.is_empty() {
            return Ok(0);
        }

        let count = requests.len();
        self.write(Frame::BatchRequest { requests }.encode()).await?;
        debug!(connection = %self.id, count, "Flushed batch requests");
        Ok(count)
    }

    /// Stop accepting requests and close once every outstanding request resolves
    pub fn close_gracefully(&self) {
        if self.advance(ConnectionState::Closing) {
            info!(
                connection = %self.id,
                endpoint = %self.endpoint,
                outstanding = self.outstanding.len(),
                "Closing connection"
            );
        }
        self.finish_close_if_drained();
    }

    /// Close immediately, failing every outstanding request with `error`
    pub fn abort(&self, error: ConnectionError) {
        {
            let mut reason = self.close_reason.lock();
            if reason.is_none() {
                *reason = Some(error.clone());
            }
        }

        // Closing refuses new requests; Closed makes the pool reap, so it
        // must wait until every outstanding request has its error
        self.advance(ConnectionState::Closing);
        self.fail_outstanding(&error);
        if self.advance(ConnectionState::Closed) {
            warn!(connection = %self.id, endpoint = %self.endpoint, %error, "Connection lost");
        }
        self.shutdown.cancel();
    }

    fn register(self: &Arc<Self>) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        let request_id = self.next_id();
        self.outstanding.insert(
            request_id,
            PendingRequest {
                sender,
                sent_at: Instant::now(),
            },
        );

        PendingReply {
            connection: self.clone(),
            request_id,
            receiver,
            settled: false,
        }
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != NO_REPLY_ID && !self.outstanding.contains_key(&id) {
                return id;
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Active => Ok(()),
            _ => Err(self.close_reason().unwrap_or_else(|| ConnectionError::Lost {
                endpoint: self.endpoint.to_string(),
                message: "connection is closing".to_string(),
            })),
        }
    }

    async fn write(&self, frame: Bytes) -> Result<(), SendError> {
        let _order = self.write_lock.lock().await;
        self.ensure_usable().map_err(SendError::not_sent)?;

        match self.transceiver.send(frame).await {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            // Rejected before anything was written; the session is still fine
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                Err(SendError::not_sent(e.into_connection_error(&self.endpoint)))
            }
            Err(e) => {
                let error = e.into_connection_error(&self.endpoint);
                self.abort(error.clone());
                Err(SendError { error, sent: true })
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Move the state forward; returns false if it was already at or past `to`
    fn advance(&self, to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to as u8).then_some(to as u8)
            })
            .is_ok()
    }

    fn complete(&self, request_id: u32, body: Bytes) {
        match self.outstanding.remove(&request_id) {
            Some((_, pending)) => {
                debug!(
                    connection = %self.id,
                    request_id,
                    latency_us = pending.sent_at.elapsed().as_micros() as u64,
                    "Reply received"
                );
                let _ = pending.sender.send(Ok(body));
                self.touch();
                self.finish_close_if_drained();
            }
            None => debug!(connection = %self.id, request_id, "Discarding unmatched reply"),
        }
    }

    fn abandon(&self, request_id: u32) {
        if self.outstanding.remove(&request_id).is_some() {
            debug!(connection = %self.id, request_id, "Abandoned pending request");
        }
        self.finish_close_if_drained();
    }

    fn fail_outstanding(&self, error: &ConnectionError) {
        let ids: Vec<u32> = self.outstanding.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.outstanding.remove(&id) {
                let _ = pending.sender.send(Err(error.clone()));
            }
        }
    }

    fn finish_close_if_drained(&self) {
        if self.state() == ConnectionState::Closing && self.outstanding.is_empty() {
            self.advance(ConnectionState::Closed);
            self.shutdown.cancel();
        }
    }

    async fn run_reader(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.transceiver.recv() => received,
            };

            let frame = match received {
                Ok(bytes) => Frame::decode(bytes)
                    .map_err(|e| TransportError::protocol(e.to_string()).into_connection_error(&self.endpoint)),
                Err(e) => Err(e.into_connection_error(&self.endpoint)),
            };

            match frame {
                Ok(Frame::Reply { request_id, body }) => self.complete(request_id, body),
                Ok(Frame::ValidateConnection) => debug!(connection = %self.id, "Ignoring repeated validation"),
                Ok(Frame::CloseConnection) => {
                    self.abort(ConnectionError::Lost {
                        endpoint: self.endpoint.to_string(),
                        message: "peer closed the connection".to_string(),
                    });
                    break;
                }
                Ok(other) => {
                    self.abort(ConnectionError::ProtocolViolation {
                        endpoint: self.endpoint.to_string(),
                        message: format!("unexpected {} frame from server", other.kind_name()),
                    });
                    break;
                }
                Err(error) => {
                    self.abort(error);
                    break;
                }
            }
        }

        // Graceful closes announce themselves to the peer
        if self.close_reason().is_none() {
            let _order = self.write_lock.lock().await;
            if let Err(e) = self.transceiver.send(Frame::CloseConnection.encode()).await {
                debug!(connection = %self.id, "Failed to send close notification: {}", e);
            }
        }

        self.advance(ConnectionState::Closed);
        self.shutdown.cancel();
        self.transceiver.close().await;
        debug!(connection = %self.id, "Reader task stopped");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.to_string())
            .field("state", &self.state())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

/// Handle to an outstanding twoway request
pub struct PendingReply {
    connection: Arc<Connection>,
    request_id: u32,
    receiver: oneshot::Receiver<Result<Bytes, ConnectionError>>,
    settled: bool,
}

impl PendingReply {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub async fn wait(mut self) -> Result<Bytes, ConnectionError> {
        let result = match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Lost {
                endpoint: self.connection.endpoint.to_string(),
                message: "reply channel closed".to_string(),
            }),
        };
        self.settled = true;
        result
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.settled {
            self.connection.abandon(self.request_id);
        }
    }
}
