//! Frame definitions and serialization for the sync transport.
//!
//! Every message on the wire is a frame with a fixed 12-byte header
//! followed by a UTF-8 topic and an opaque payload:
//!
//! ```text
//! magic:4 | version:1 | kind:1 | topic_length:2 | payload_length:4 | topic | payload
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x5253_0001;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted by a receiver (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Role of a frame on its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Broadcast message from a publish socket.
    Publish = 1,
    /// Request sent to a reply server.
    Request = 2,
    /// Reply to a request; an empty payload is the discarded-request marker.
    Reply = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(FrameKind::Publish),
            2 => Ok(FrameKind::Request),
            3 => Ok(FrameKind::Reply),
            other => Err(TransportError::InvalidFrame {
                reason: format!("unknown frame kind {}", other),
            }),
        }
    }
}

/// Frame header containing the lengths of the variable parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame role.
    pub kind: FrameKind,
    /// Topic length in bytes.
    pub topic_length: u16,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Decode and validate a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut cursor = &buf[..];
        let magic = cursor.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let kind = FrameKind::try_from(cursor.get_u8())?;
        let topic_length = cursor.get_u16();
        let payload_length = cursor.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            topic_length,
            payload_length,
        })
    }

    /// Total number of bytes following the header.
    pub fn body_length(&self) -> usize {
        self.topic_length as usize + self.payload_length as usize
    }
}

/// A single topic-addressed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame role.
    pub kind: FrameKind,
    /// Message topic.
    pub topic: String,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            topic: topic.into(),
            payload,
        }
    }

    /// Reply frame carrying the empty discarded-request marker.
    pub fn discarded(topic: impl Into<String>) -> Self {
        Self::new(FrameKind::Reply, topic, Vec::new())
    }

    /// True if this is a reply without content.
    pub fn is_discarded(&self) -> bool {
        self.kind == FrameKind::Reply && self.payload.is_empty()
    }

    /// Serialize the frame, header included.
    pub fn encode(&self) -> Result<BytesMut> {
        let topic = self.topic.as_bytes();
        let topic_length = u16::try_from(topic.len()).map_err(|_| TransportError::InvalidFrame {
            reason: format!("topic too long ({} bytes)", topic.len()),
        })?;
        let payload_length = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or(TransportError::PayloadTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max_size: MAX_PAYLOAD_SIZE,
            })?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + topic.len() + self.payload.len());
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u16(topic_length);
        buf.put_u32(payload_length);
        buf.put_slice(topic);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Rebuild a frame from a decoded header and its body bytes.
    pub fn from_parts(header: FrameHeader, body: Vec<u8>) -> Result<Self> {
        if body.len() != header.body_length() {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "body length mismatch: header says {}, got {}",
                    header.body_length(),
                    body.len()
                ),
            });
        }
        let mut body = body;
        let payload = body.split_off(header.topic_length as usize);
        let topic = String::from_utf8(body).map_err(|e| TransportError::InvalidFrame {
            reason: format!("topic is not valid UTF-8: {}", e),
        })?;
        Ok(Self {
            kind: header.kind,
            topic,
            payload,
        })
    }

    /// Decode a complete frame from a contiguous buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("truncated header ({} bytes)", buf.len()),
            });
        }
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&raw)?;
        Self::from_parts(header, buf[FRAME_HEADER_SIZE..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_publish() {
        let frame = Frame::new(FrameKind::Publish, "cluster/sub/add", vec![1, 2, 3]);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 15 + 3);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_discarded_marker() {
        let frame = Frame::discarded("unknown");
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert!(decoded.is_discarded());
        assert!(!Frame::new(FrameKind::Reply, "x", vec![0]).is_discarded());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = Frame::new(FrameKind::Request, "t", vec![]).encode().unwrap();
        encoded[0] = 0xFF;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut encoded = Frame::new(FrameKind::Request, "t", vec![]).encode().unwrap();
        encoded[4] = 9;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TransportError::VersionMismatch { expected: 1, got: 9 })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut encoded = Frame::new(FrameKind::Request, "t", vec![]).encode().unwrap();
        encoded[5] = 42;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TransportError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let encoded = Frame::new(FrameKind::Publish, "topic", vec![9; 10]).encode().unwrap();
        let truncated = &encoded[..encoded.len() - 1];
        assert!(Frame::decode(truncated).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut encoded = Frame::new(FrameKind::Publish, "t", vec![]).encode().unwrap();
        encoded[8..12].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            Frame::decode(&encoded),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
            let _ = Frame::decode(&bytes);
        }

        #[test]
        fn prop_trailing_bytes_rejected(topic in "[a-z/]{1,32}", payload in proptest::collection::vec(proptest::num::u8::ANY, 0..64), extra in 1usize..8) {
            let mut encoded = Frame::new(FrameKind::Publish, topic, payload).encode().unwrap();
            encoded.extend_from_slice(&vec![0u8; extra]);
            proptest::prop_assert!(Frame::decode(&encoded).is_err());
        }
    }
}
