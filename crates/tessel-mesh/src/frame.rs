//! Multi-frame messages and their wire encoding.
//!
//! Every message travels as one length-delimited packet. The packet body
//! is a frame count followed by each frame, length-prefixed:
//!
//! ```text
//! u32 count | u32 len | bytes | u32 len | bytes | ...
//! ```
//!
//! All integers are big-endian. Router endpoints attach the sender's
//! address frame on receipt and strip it before sending, so the address
//! never crosses the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtocolError;

/// An ordered list of frames forming one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group(Vec<Bytes>);

impl Group {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self(frames)
    }

    /// A message with a single payload frame.
    pub fn single(payload: Bytes) -> Self {
        Self(vec![payload])
    }

    /// `[address, payload]`, as seen by a router endpoint.
    pub fn routed(address: Bytes, payload: Bytes) -> Self {
        Self(vec![address, payload])
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_frames(self) -> Vec<Bytes> {
        self.0
    }

    /// Prepend an address frame.
    pub fn with_route(mut self, address: Bytes) -> Self {
        self.0.insert(0, address);
        self
    }

    /// Split off the leading address frame.
    pub fn split_route(mut self) -> Result<(Bytes, Group), ProtocolError> {
        if self.0.len() < 2 {
            return Err(ProtocolError::MalformedGroup(format!(
                "expected address and payload, got {} frame(s)",
                self.0.len()
            )));
        }
        let address = self.0.remove(0);
        Ok((address, self))
    }

    /// The payload of a one-frame message.
    pub fn into_single(mut self) -> Result<Bytes, ProtocolError> {
        match self.0.len() {
            1 => Ok(self.0.remove(0)),
            n => Err(ProtocolError::MalformedGroup(format!(
                "expected one payload frame, got {n}"
            ))),
        }
    }

    /// Encode the packet body (without the outer length prefix).
    pub fn encode_body(&self) -> Bytes {
        let len = 4 + self.0.iter().map(|f| 4 + f.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32(self.0.len() as u32);
        for frame in &self.0 {
            buf.put_u32(frame.len() as u32);
            buf.put_slice(frame);
        }
        buf.freeze()
    }

    /// Decode a packet body produced by [`Group::encode_body`].
    pub fn decode_body(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.remaining() < 4 {
            return Err(ProtocolError::MalformedGroup("missing frame count".into()));
        }
        let count = body.get_u32() as usize;
        if count == 0 {
            return Err(ProtocolError::MalformedGroup("message has no frames".into()));
        }
        let mut frames = Vec::with_capacity(count.min(64));
        for i in 0..count {
            if body.remaining() < 4 {
                return Err(ProtocolError::MalformedGroup(format!(
                    "frame {i} of {count} is missing its length"
                )));
            }
            let len = body.get_u32() as usize;
            if body.remaining() < len {
                return Err(ProtocolError::MalformedGroup(format!(
                    "frame {i} claims {len} bytes, {} left",
                    body.remaining()
                )));
            }
            frames.push(body.split_to(len));
        }
        if body.has_remaining() {
            return Err(ProtocolError::MalformedGroup(format!(
                "{} trailing bytes after {count} frame(s)",
                body.remaining()
            )));
        }
        Ok(Self(frames))
    }
}

impl From<Bytes> for Group {
    fn from(payload: Bytes) -> Self {
        Self::single(payload)
    }
}

/// Length-delimited packet codec carrying [`Group`]s.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }

    /// Append one encoded message to `dst`.
    pub fn encode(&mut self, group: &Group, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.inner
            .encode(group.encode_body(), dst)
            .map_err(|e| ProtocolError::MalformedGroup(e.to_string()))
    }

    /// Take the next complete message from `src`, if one has arrived.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Group>, ProtocolError> {
        match self.inner.decode(src) {
            Ok(Some(body)) => Group::decode_body(body.freeze()).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(ProtocolError::MalformedGroup(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_handles_partial_and_back_to_back_packets() {
        let mut codec = FrameCodec::new(1024);
        let mut wire = BytesMut::new();
        let first = Group::routed(Bytes::from_static(b"addr"), Bytes::from_static(b"hello"));
        let second = Group::single(Bytes::from_static(b"world"));
        codec.encode(&first, &mut wire).unwrap();
        codec.encode(&second, &mut wire).unwrap();

        let mut partial = wire.split_to(5);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(wire);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(second));
        assert!(partial.is_empty());
    }

    #[test]
    fn truncated_body_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u32(2);
        body.put_u32(3);
        body.put_slice(b"abc");
        let err = Group::decode_body(body.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedGroup(_)));

        let err = Group::decode_body(Bytes::from_static(&[0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedGroup(_)));
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let mut codec = FrameCodec::new(8);
        let mut wire = BytesMut::new();
        let big = Group::single(Bytes::from(vec![7u8; 64]));
        assert!(codec.encode(&big, &mut wire).is_err());
    }

    #[test]
    fn route_split() {
        let group = Group::single(Bytes::from_static(b"p")).with_route(Bytes::from_static(b"a"));
        let (addr, rest) = group.split_route().unwrap();
        assert_eq!(&addr[..], b"a");
        assert_eq!(&rest.into_single().unwrap()[..], b"p");
        assert!(Group::single(Bytes::new()).split_route().is_err());
    }
}
