//! TCP Transport Implementation
//!
//! Frames are written with a 4-byte big-endian length prefix. The stream is
//! split so the connection's reader task and its writers never contend for
//! the same lock.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Connector, Transceiver, TransportError, TransportResult};
use crate::endpoint::{EndpointDescriptor, TransportKind};

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], max_message_size: usize) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > max_message_size {
        return Err(TransportError::FrameTooLarge {
            size: frame.len(),
            max: max_message_size,
        });
    }

    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> TransportResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let message_len = u32::from_be_bytes(len_bytes) as usize;
    if message_len > max_message_size {
        return Err(TransportError::protocol(format!(
            "Message size {} exceeds maximum {}",
            message_len, max_message_size
        )));
    }

    let mut buf = BytesMut::zeroed(message_len);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Opens TCP sessions; `ssl` and `udp` endpoints are rejected as unsupported
#[derive(Debug, Clone)]
pub struct TcpConnector {
    max_message_size: usize,
}

impl TcpConnector {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(remoting_config::defaults::connection::MAX_MESSAGE_SIZE)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> TransportResult<Arc<dyn Transceiver>> {
        if endpoint.transport != TransportKind::Tcp {
            return Err(TransportError::Unsupported {
                transport: endpoint.transport.as_str().to_string(),
            });
        }

        let address = endpoint.address();
        debug!(%address, timeout_ms = timeout.as_millis() as u64, "Connecting to TCP peer");

        let stream = tokio::time::timeout(timeout, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| match TransportError::from(e) {
                // Any failure before the session exists is a refused connect
                TransportError::ConnectionLost { message } => TransportError::ConnectRefused { message },
                other => other,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let peer_addr = stream.peer_addr()?;
        info!(peer = %peer_addr, "Connected to TCP peer");

        Ok(Arc::new(TcpTransceiver::new(stream, peer_addr, self.max_message_size)))
    }
}

/// Split TCP stream with per-direction locks
pub struct TcpTransceiver {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: SocketAddr,
    max_message_size: usize,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TcpTransceiver {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_message_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer_addr,
            max_message_size,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame, self.max_message_size).await?;
        let total = self.bytes_sent.fetch_add(4 + frame.len() as u64, Ordering::Relaxed);

        debug!(
            peer = %self.peer_addr,
            bytes = frame.len(),
            total_sent = total + 4 + frame.len() as u64,
            "Sent frame over TCP"
        );
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut reader = self.reader.lock().await;
        let frame = read_frame(&mut *reader, self.max_message_size).await?;
        self.bytes_received.fetch_add(4 + frame.len() as u64, Ordering::Relaxed);

        debug!(peer = %self.peer_addr, bytes = frame.len(), "Received frame over TCP");
        Ok(frame)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.peer_addr, "Error shutting down TCP connection: {}", e);
        }
        info!(peer = %self.peer_addr, "Closed TCP connection");
    }
}
