//! In-process fakes for the transport and the location service.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::{DecodedReply, DecodedRequest, PassthroughCodec};
use crate::endpoint::{EndpointDescriptor, TransportKind};
use crate::frame::{Frame, NO_REPLY_ID};
use crate::location::{LocationService, LocatorError, StaticLocator};
use crate::reference::{Identity, Reference};
use crate::transports::{Connector, Transceiver, TransportError, TransportResult};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client half of an in-memory session
pub struct MemoryTransceiver {
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Server half of an in-memory session; dropping it severs the connection
pub struct PeerSide {
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

pub fn memory_pair() -> (MemoryTransceiver, PeerSide) {
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let (to_client, from_peer) = mpsc::unbounded_channel();
    (
        MemoryTransceiver {
            outbound: Mutex::new(Some(to_peer)),
            inbound: tokio::sync::Mutex::new(from_peer),
        },
        PeerSide {
            outbound: Mutex::new(Some(to_client)),
            inbound: tokio::sync::Mutex::new(from_client),
        },
    )
}

#[async_trait]
impl Transceiver for MemoryTransceiver {
    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        let outbound = self.outbound.lock().clone();
        match outbound {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::connection_lost("peer went away")),
            None => Err(TransportError::connection_lost("transceiver closed")),
        }
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::connection_lost("peer went away"))
    }

    async fn close(&self) {
        self.outbound.lock().take();
    }
}

impl PeerSide {
    pub async fn send(&self, frame: Frame) {
        let outbound = self.outbound.lock().clone();
        if let Some(tx) = outbound {
            let _ = tx.send(frame.encode());
        }
    }

    /// Next frame from the client, or `None` once the client closed
    pub async fn try_recv(&self) -> Option<Frame> {
        let bytes = self.inbound.lock().await.recv().await?;
        Some(Frame::decode(bytes).expect("client sent a malformed frame"))
    }

    pub async fn recv(&self) -> Frame {
        self.try_recv().await.expect("client closed the session")
    }

    /// Sever the session from the server side
    pub fn disconnect(&self) {
        self.outbound.lock().take();
    }
}

/// How a scripted endpoint answers connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Refuse,
    /// Never completes the connect
    Hang,
    /// Accepts the transport but never validates the session
    Silent,
}

/// What a scripted server does with one request
#[derive(Debug, Clone)]
pub enum PeerAction {
    Reply(DecodedReply),
    /// Swallow the request
    Ignore,
    /// Drop the session after reading the request
    Disconnect,
    ReplyAfter(Duration, DecodedReply),
    /// Answer with a frame a server must never send
    Misbehave,
}

pub type Handler = Arc<dyn Fn(&DecodedRequest) -> PeerAction + Send + Sync>;

/// Echoes the request parameters back as the reply
pub fn echo_handler() -> Handler {
    Arc::new(|request: &DecodedRequest| PeerAction::Reply(DecodedReply::Ok(request.params.clone())))
}

/// Connector whose endpoints are served by in-process scripted peers
pub struct ScriptedConnector {
    behaviors: Mutex<HashMap<(String, u16), Behavior>>,
    handler: Mutex<Handler>,
    connect_delay: Duration,
    connects: Mutex<Vec<EndpointDescriptor>>,
    received: Arc<Mutex<Vec<DecodedRequest>>>,
    peers: Mutex<Vec<Arc<PeerSide>>>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            handler: Mutex::new(echo_handler()),
            connect_delay: Duration::ZERO,
            connects: Mutex::new(Vec::new()),
            received: Arc::new(Mutex::new(Vec::new())),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_handler(self, handler: Handler) -> Self {
        *self.handler.lock() = handler;
        self
    }

    pub fn set_behavior(&self, host: &str, port: u16, behavior: Behavior) {
        self.behaviors.lock().insert((host.to_string(), port), behavior);
    }

    pub fn total_connects(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn connects_to(&self, host: &str, port: u16) -> usize {
        self.connects
            .lock()
            .iter()
            .filter(|endpoint| endpoint.host == host && endpoint.port == port)
            .count()
    }

    /// Every request the peers have read, batch entries included
    pub fn received(&self) -> Vec<DecodedRequest> {
        self.received.lock().clone()
    }

    pub fn received_count(&self, operation: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|request| request.operation == operation)
            .count()
    }

    /// Sever every session served so far
    pub fn disconnect_all(&self) {
        for peer in self.peers.lock().drain(..) {
            peer.disconnect();
        }
    }

    fn spawn_peer(&self, peer: Arc<PeerSide>) {
        let handler = self.handler.lock().clone();
        let received = self.received.clone();
        let codec = PassthroughCodec;

        tokio::spawn(async move {
            peer.send(Frame::ValidateConnection).await;

            while let Some(frame) = peer.try_recv().await {
                let (request_id, bodies) = match frame {
                    Frame::Request { request_id, body } => (request_id, vec![body]),
                    Frame::BatchRequest { requests } => (NO_REPLY_ID, requests),
                    Frame::CloseConnection => break,
                    _ => continue,
                };

                for body in bodies {
                    let Ok(request) = codec.decode_request(body) else {
                        continue;
                    };
                    received.lock().push(request.clone());

                    match handler(&request) {
                        PeerAction::Reply(reply) => {
                            if request_id != NO_REPLY_ID {
                                let body = codec.encode_reply(&reply);
                                peer.send(Frame::Reply { request_id, body }).await;
                            }
                        }
                        PeerAction::ReplyAfter(delay, reply) => {
                            if request_id != NO_REPLY_ID {
                                let peer = peer.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let body = codec.encode_reply(&reply);
                                    peer.send(Frame::Reply { request_id, body }).await;
                                });
                            }
                        }
                        PeerAction::Ignore => {}
                        PeerAction::Misbehave => {
                            peer.send(Frame::BatchRequest { requests: Vec::new() }).await;
                        }
                        PeerAction::Disconnect => {
                            peer.disconnect();
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        _timeout: Duration,
    ) -> TransportResult<Arc<dyn Transceiver>> {
        self.connects.lock().push(endpoint.clone());
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        // Scripted peers speak plain streams only
        if endpoint.transport == TransportKind::Ssl {
            return Err(TransportError::Unsupported {
                transport: endpoint.transport.as_str().to_string(),
            });
        }

        let behavior = self
            .behaviors
            .lock()
            .get(&(endpoint.host.clone(), endpoint.port))
            .copied()
            .unwrap_or(Behavior::Accept);

        match behavior {
            Behavior::Refuse => Err(TransportError::ConnectRefused {
                message: "scripted refusal".to_string(),
            }),
            Behavior::Hang => futures::future::pending().await,
            Behavior::Silent => {
                let (client, peer) = memory_pair();
                self.peers.lock().push(Arc::new(peer));
                Ok(Arc::new(client))
            }
            Behavior::Accept => {
                let (client, peer) = memory_pair();
                let peer = Arc::new(peer);
                self.peers.lock().push(peer.clone());
                self.spawn_peer(peer);
                Ok(Arc::new(client))
            }
        }
    }
}

/// Location service that counts calls and can be made slow or unreachable
pub struct CountingLocator {
    inner: StaticLocator,
    calls: AtomicUsize,
    delay: Duration,
    unreachable: AtomicBool,
}

impl CountingLocator {
    pub fn new(inner: StaticLocator) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<(), LocatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LocatorError::unreachable("scripted outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl LocationService for CountingLocator {
    async fn find_adapter_endpoints(&self, adapter_id: &str) -> Result<Vec<EndpointDescriptor>, LocatorError> {
        self.before_call().await?;
        self.inner.find_adapter_endpoints(adapter_id).await
    }

    async fn find_object_by_id(&self, identity: &Identity) -> Result<Reference, LocatorError> {
        self.before_call().await?;
        self.inner.find_object_by_id(identity).await
    }
}
