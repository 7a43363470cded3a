//! Connection Frame Format
//!
//! Every message exchanged on a connection is one frame. The transport delivers
//! whole frames; this module only adds the kind byte and the correlation id
//! around the opaque codec bodies.
//!
//! ```text
//! Request          [0][request_id: u32 BE][body...]       request_id 0 = no reply
//! BatchRequest     [1][count: u32 BE]([len: u32 BE][body])*
//! Reply            [2][request_id: u32 BE][body...]
//! ValidateConnection [3]
//! CloseConnection  [4]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{RemotingError, Result};

const KIND_REQUEST: u8 = 0;
const KIND_BATCH_REQUEST: u8 = 1;
const KIND_REPLY: u8 = 2;
const KIND_VALIDATE: u8 = 3;
const KIND_CLOSE: u8 = 4;

/// Correlation id reserved for requests that expect no reply
pub const NO_REPLY_ID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request { request_id: u32, body: Bytes },
    BatchRequest { requests: Vec<Bytes> },
    Reply { request_id: u32, body: Bytes },
    /// Sent by the accepting side once the session is ready
    ValidateConnection,
    /// Graceful close notification
    CloseConnection,
}

impl Frame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::BatchRequest { .. } => "batch_request",
            Frame::Reply { .. } => "reply",
            Frame::ValidateConnection => "validate_connection",
            Frame::CloseConnection => "close_connection",
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Request { request_id, body } | Frame::Reply { request_id, body } => {
                let kind = if matches!(self, Frame::Request { .. }) {
                    KIND_REQUEST
                } else {
                    KIND_REPLY
                };
                let mut buf = BytesMut::with_capacity(5 + body.len());
                buf.put_u8(kind);
                buf.put_u32(*request_id);
                buf.put_slice(body);
                buf.freeze()
            }
            Frame::BatchRequest { requests } => {
                let size = 5 + requests.iter().map(|r| 4 + r.len()).sum::<usize>();
                let mut buf = BytesMut::with_capacity(size);
                buf.put_u8(KIND_BATCH_REQUEST);
                buf.put_u32(requests.len() as u32);
                for request in requests {
                    buf.put_u32(request.len() as u32);
                    buf.put_slice(request);
                }
                buf.freeze()
            }
            Frame::ValidateConnection => Bytes::from_static(&[KIND_VALIDATE]),
            Frame::CloseConnection => Bytes::from_static(&[KIND_CLOSE]),
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Frame> {
        if !buf.has_remaining() {
            return Err(RemotingError::protocol("empty frame"));
        }

        match buf.get_u8() {
            KIND_REQUEST => {
                let request_id = read_u32(&mut buf, "request id")?;
                Ok(Frame::Request {
                    request_id,
                    body: buf,
                })
            }
            KIND_REPLY => {
                let request_id = read_u32(&mut buf, "request id")?;
                Ok(Frame::Reply {
                    request_id,
                    body: buf,
                })
            }
            KIND_BATCH_REQUEST => {
                let count = read_u32(&mut buf, "batch count")? as usize;
                // Each entry needs at least its length prefix
                if count > buf.remaining() / 4 {
                    return Err(RemotingError::protocol(format!(
                        "batch count {} exceeds frame size",
                        count
                    )));
                }
                let mut requests = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = read_u32(&mut buf, "batch entry length")? as usize;
                    if buf.remaining() < len {
                        return Err(RemotingError::protocol(format!(
                            "batch entry of {} bytes truncated to {}",
                            len,
                            buf.remaining()
                        )));
                    }
                    requests.push(buf.split_to(len));
                }
                if buf.has_remaining() {
                    return Err(RemotingError::protocol("trailing bytes after batch"));
                }
                Ok(Frame::BatchRequest { requests })
            }
            KIND_VALIDATE => expect_end(buf, Frame::ValidateConnection),
            KIND_CLOSE => expect_end(buf, Frame::CloseConnection),
            other => Err(RemotingError::protocol(format!("unknown frame kind {}", other))),
        }
    }
}

fn read_u32(buf: &mut Bytes, field: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(RemotingError::protocol(format!("frame truncated reading {}", field)));
    }
    Ok(buf.get_u32())
}

fn expect_end(buf: Bytes, frame: Frame) -> Result<Frame> {
    if buf.has_remaining() {
        return Err(RemotingError::protocol(format!(
            "unexpected payload on {}",
            frame.kind_name()
        )));
    }
    Ok(frame)
}
