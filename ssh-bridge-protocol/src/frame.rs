//! The frame codec: a 5-byte header (4-byte big-endian payload length, then
//! a 1-byte type tag) followed by an opaque payload. The decoder accepts
//! bytes in arbitrary chunks and only ever buffers one partial frame.

use std::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Maximum payload length we are willing to buffer for a single frame.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(u32),
    #[error("unknown frame type tag {0}")]
    UnknownTag(u8),
    #[error("frame type tag must be in [1, 255], got 0")]
    ZeroTag,
}

/// The fixed, ABI-stable set of frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Reuse = 1,
    Connect = 2,
    Challenge = 3,
    ChallengeResponse = 4,
    Connected = 5,
    Unconnected = 6,
    Disconnected = 7,
    SimpleCommand = 8,
    PtyCommand = 9,
    Result = 10,
    Stdin = 11,
    Stdout = 12,
    Stderr = 13,
    Exception = 14,
    Share = 15,
    Shared = 16,
    Resize = 17,
}

impl Tag {
    fn from_u8(tag: u8) -> Result<Tag, ProtocolError> {
        match tag {
            0 => Err(ProtocolError::ZeroTag),
            1 => Ok(Tag::Reuse),
            2 => Ok(Tag::Connect),
            3 => Ok(Tag::Challenge),
            4 => Ok(Tag::ChallengeResponse),
            5 => Ok(Tag::Connected),
            6 => Ok(Tag::Unconnected),
            7 => Ok(Tag::Disconnected),
            8 => Ok(Tag::SimpleCommand),
            9 => Ok(Tag::PtyCommand),
            10 => Ok(Tag::Result),
            11 => Ok(Tag::Stdin),
            12 => Ok(Tag::Stdout),
            13 => Ok(Tag::Stderr),
            14 => Ok(Tag::Exception),
            15 => Ok(Tag::Share),
            16 => Ok(Tag::Shared),
            17 => Ok(Tag::Resize),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;
    fn try_from(v: u8) -> Result<Tag, ProtocolError> {
        Tag::from_u8(v)
    }
}

/// A single decoded frame: a type tag plus its opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(tag: Tag, data: Vec<u8>) -> Frame {
        Frame { tag, data }
    }

    /// Encode this frame as header + payload, ready to write to the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.data.len() as u64 > MAX_PAYLOAD_LEN as u64 {
            return Err(ProtocolError::PayloadTooLarge(self.data.len() as u32));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len());
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], self.data.len() as u32);
        header[4] = self.tag as u8;
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }
}

/// Incremental frame decoder. Feed it arbitrarily-sized chunks of bytes via
/// [`Decoder::push`]; it returns every frame that became complete, in
/// receipt order, and retains at most one partial frame's worth of bytes
/// between calls.
#[derive(Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let payload_len = BigEndian::read_u32(&self.buf[0..4]);
            if payload_len > MAX_PAYLOAD_LEN {
                return Err(ProtocolError::PayloadTooLarge(payload_len));
            }
            let tag = Tag::from_u8(self.buf[4])?;

            let frame_len = HEADER_LEN + payload_len as usize;
            if self.buf.len() < frame_len {
                break;
            }

            let data = self.buf[HEADER_LEN..frame_len].to_vec();
            self.buf.drain(0..frame_len);
            frames.push(Frame::new(tag, data));
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tags() -> Vec<Tag> {
        vec![
            Tag::Reuse,
            Tag::Connect,
            Tag::Challenge,
            Tag::ChallengeResponse,
            Tag::Connected,
            Tag::Unconnected,
            Tag::Disconnected,
            Tag::SimpleCommand,
            Tag::PtyCommand,
            Tag::Result,
            Tag::Stdin,
            Tag::Stdout,
            Tag::Stderr,
            Tag::Exception,
            Tag::Share,
            Tag::Shared,
            Tag::Resize,
        ]
    }

    #[test]
    fn round_trips_every_tag() {
        for tag in all_tags() {
            let frame = Frame::new(tag, b"some payload bytes".to_vec());
            let encoded = frame.encode().unwrap();

            let mut dec = Decoder::new();
            let decoded = dec.push(&encoded).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0], frame);
        }
    }

    #[test]
    fn round_trips_empty_payload() {
        let frame = Frame::new(Tag::Stdin, vec![]);
        let encoded = frame.encode().unwrap();
        let mut dec = Decoder::new();
        let decoded = dec.push(&encoded).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn handles_arbitrary_chunking() {
        let f1 = Frame::new(Tag::Stdout, b"hello".to_vec());
        let f2 = Frame::new(Tag::Stderr, b"world!".to_vec());
        let mut wire = f1.encode().unwrap();
        wire.extend_from_slice(&f2.encode().unwrap());

        let mut dec = Decoder::new();
        let mut got = Vec::new();
        for byte in wire {
            got.extend(dec.push(&[byte]).unwrap());
        }
        assert_eq!(got, vec![f1, f2]);
    }

    #[test]
    fn buffers_only_one_partial_frame() {
        let f1 = Frame::new(Tag::Stdout, b"abc".to_vec());
        let wire = f1.encode().unwrap();

        let mut dec = Decoder::new();
        assert!(dec.push(&wire[0..3]).unwrap().is_empty());
        assert!(dec.buf.len() <= wire.len());
        let rest = dec.push(&wire[3..]).unwrap();
        assert_eq!(rest, vec![f1]);
        assert!(dec.buf.is_empty());
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], MAX_PAYLOAD_LEN + 1);
        header[4] = Tag::Stdin as u8;

        let mut dec = Decoder::new();
        let err = dec.push(&header).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge(_)));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], 0);
        header[4] = 200;

        let mut dec = Decoder::new();
        let err = dec.push(&header).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(200)));
    }

    #[test]
    fn rejects_zero_tag() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[0..4], 0);
        header[4] = 0;

        let mut dec = Decoder::new();
        let err = dec.push(&header).unwrap_err();
        assert!(matches!(err, ProtocolError::ZeroTag));
    }
}
