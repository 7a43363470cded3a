//! Request/reply body encoding.
//!
//! The runtime never looks inside a body; it hands the codec the request
//! header and marshaled parameters and gets back either the out parameters or
//! an encoded application exception.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::reference::{Context, EncodingVersion, Identity, InvocationMode};
use crate::{RemotingError, Result};

/// Everything a codec needs to frame one request body
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader<'a> {
    pub identity: &'a Identity,
    pub facet: Option<&'a str>,
    pub operation: &'a str,
    pub mode: InvocationMode,
    pub idempotent: bool,
    pub encoding: EncodingVersion,
    pub context: &'a Context,
}

/// Decoded reply body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedReply {
    /// Out parameters of a successful call
    Ok(Bytes),
    /// Encoded user exception raised by the remote object
    Exception(Bytes),
}

/// Pluggable payload encoding
pub trait Codec: Send + Sync + 'static {
    fn encode_request(&self, header: &RequestHeader<'_>, params: &[u8]) -> Result<Bytes>;

    fn decode_reply(&self, body: Bytes) -> Result<DecodedReply>;
}

const REPLY_OK: u8 = 0;
const REPLY_EXCEPTION: u8 = 1;

/// Minimal self-describing codec.
///
/// Requests carry the header as length-prefixed UTF-8 strings followed by the
/// raw parameters. Replies are a status byte followed by the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

/// A request body as decoded by the receiving side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub identity: Identity,
    pub facet: Option<String>,
    pub operation: String,
    pub mode: InvocationMode,
    pub idempotent: bool,
    pub encoding: EncodingVersion,
    pub context: Context,
    pub params: Bytes,
}

impl Codec for PassthroughCodec {
    fn encode_request(&self, header: &RequestHeader<'_>, params: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64 + params.len());
        put_str(&mut buf, &header.identity.name)?;
        put_str(&mut buf, &header.identity.category)?;
        put_str(&mut buf, header.facet.unwrap_or(""))?;
        put_str(&mut buf, header.operation)?;
        buf.put_u8(mode_to_byte(header.mode));
        buf.put_u8(header.idempotent as u8);
        buf.put_u8(header.encoding.major);
        buf.put_u8(header.encoding.minor);

        let entries = u16::try_from(header.context.len())
            .map_err(|_| RemotingError::protocol("request context has too many entries"))?;
        buf.put_u16(entries);
        for (key, value) in header.context {
            put_str(&mut buf, key)?;
            put_str(&mut buf, value)?;
        }

        buf.put_slice(params);
        Ok(buf.freeze())
    }

    fn decode_reply(&self, mut body: Bytes) -> Result<DecodedReply> {
        if !body.has_remaining() {
            return Err(RemotingError::protocol("empty reply body"));
        }
        match body.get_u8() {
            REPLY_OK => Ok(DecodedReply::Ok(body)),
            REPLY_EXCEPTION => Ok(DecodedReply::Exception(body)),
            status => Err(RemotingError::protocol(format!("unknown reply status {}", status))),
        }
    }
}

impl PassthroughCodec {
    /// Encode a reply body; used by peers answering this codec's requests
    pub fn encode_reply(&self, reply: &DecodedReply) -> Bytes {
        let (status, payload) = match reply {
            DecodedReply::Ok(payload) => (REPLY_OK, payload),
            DecodedReply::Exception(payload) => (REPLY_EXCEPTION, payload),
        };
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(status);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a request body produced by [`Codec::encode_request`]
    pub fn decode_request(&self, mut body: Bytes) -> Result<DecodedRequest> {
        let name = get_str(&mut body)?;
        let category = get_str(&mut body)?;
        let facet = get_str(&mut body)?;
        let operation = get_str(&mut body)?;

        if body.remaining() < 6 {
            return Err(RemotingError::protocol("request header truncated"));
        }
        let mode = mode_from_byte(body.get_u8())?;
        let idempotent = body.get_u8() != 0;
        let encoding = EncodingVersion {
            major: body.get_u8(),
            minor: body.get_u8(),
        };

        let entries = body.get_u16();
        let mut context = Context::new();
        for _ in 0..entries {
            let key = get_str(&mut body)?;
            let value = get_str(&mut body)?;
            context.insert(key, value);
        }

        Ok(DecodedRequest {
            identity: Identity::new(name).with_category(category),
            facet: if facet.is_empty() { None } else { Some(facet) },
            operation,
            mode,
            idempotent,
            encoding,
            context,
            params: body,
        })
    }
}

fn mode_to_byte(mode: InvocationMode) -> u8 {
    match mode {
        InvocationMode::Twoway => 0,
        InvocationMode::Oneway => 1,
        InvocationMode::Batch => 2,
        InvocationMode::Datagram => 3,
    }
}

fn mode_from_byte(byte: u8) -> Result<InvocationMode> {
    match byte {
        0 => Ok(InvocationMode::Twoway),
        1 => Ok(InvocationMode::Oneway),
        2 => Ok(InvocationMode::Batch),
        3 => Ok(InvocationMode::Datagram),
        other => Err(RemotingError::protocol(format!("unknown invocation mode {}", other))),
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| RemotingError::protocol(format!("string of {} bytes too long for header", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(RemotingError::protocol("request header truncated"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(RemotingError::protocol("request header string truncated"));
    }
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|_| RemotingError::protocol("request header string is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_survives_encoding() {
        let identity = Identity::new("printer").with_category("ops");
        let mut context = Context::new();
        context.insert("trace".to_string(), "abc".to_string());

        let header = RequestHeader {
            identity: &identity,
            facet: Some("admin"),
            operation: "print",
            mode: InvocationMode::Oneway,
            idempotent: true,
            encoding: EncodingVersion::default(),
            context: &context,
        };

        let codec = PassthroughCodec;
        let body = codec.encode_request(&header, b"page-1").unwrap();
        let decoded = codec.decode_request(body).unwrap();

        assert_eq!(decoded.identity, identity);
        assert_eq!(decoded.facet.as_deref(), Some("admin"));
        assert_eq!(decoded.operation, "print");
        assert_eq!(decoded.mode, InvocationMode::Oneway);
        assert!(decoded.idempotent);
        assert_eq!(decoded.context, context);
        assert_eq!(&decoded.params[..], b"page-1");
    }

    #[test]
    fn test_reply_status() {
        let codec = PassthroughCodec;
        let ok = codec.encode_reply(&DecodedReply::Ok(Bytes::from_static(b"out")));
        assert_eq!(codec.decode_reply(ok).unwrap(), DecodedReply::Ok(Bytes::from_static(b"out")));

        let ex = codec.encode_reply(&DecodedReply::Exception(Bytes::from_static(b"boom")));
        assert!(matches!(codec.decode_reply(ex).unwrap(), DecodedReply::Exception(_)));

        assert!(codec.decode_reply(Bytes::new()).is_err());
        assert!(codec.decode_reply(Bytes::from_static(&[7])).is_err());
    }

    #[test]
    fn test_truncated_request_is_rejected() {
        let codec = PassthroughCodec;
        assert!(codec.decode_request(Bytes::from_static(&[0, 5, b'a'])).is_err());
    }
}
