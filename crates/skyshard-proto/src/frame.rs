//! Length-prefixed frame codec for the czar/worker channel
//!
//! A frame is a 4-byte big-endian length followed by one message payload.
//! The prefix is the only big-endian quantity in the protocol; payload
//! integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;
use crate::message::Message;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Codec turning a byte stream into [`Message`] values and back.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtoError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > self.max_frame_bytes {
            return Err(ProtoError::FrameTooLarge {
                length,
                max: self.max_frame_bytes,
            });
        }
        if src.len() < LENGTH_PREFIX_BYTES + length {
            // Reserve what we already know is coming to avoid repeated growth.
            src.reserve(LENGTH_PREFIX_BYTES + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let payload = src.split_to(length).freeze();
        Message::decode(payload).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let mut payload = BytesMut::new();
        item.encode(&mut payload);
        if payload.len() > self.max_frame_bytes {
            return Err(ProtoError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CancelMsg, Message};
    use skyshard_common::{JobId, QueryId};

    fn cancel() -> Message {
        Message::Cancel(CancelMsg {
            query_id: QueryId(1),
            job_id: JobId(2),
        })
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(cancel(), &mut buf).expect("encodes");

        // Feed all but the final byte: decoder must not produce a message.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).expect("no error").is_none());

        let mut full = buf.clone();
        let decoded = codec.decode(&mut full).expect("no error").expect("message");
        assert_eq!(decoded, cancel());
        assert!(full.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(1024); // claimed length far above the cap
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn frames_are_delimited_back_to_back() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(cancel(), &mut buf).expect("encodes");
        codec.encode(cancel(), &mut buf).expect("encodes");

        assert_eq!(codec.decode(&mut buf).expect("ok"), Some(cancel()));
        assert_eq!(codec.decode(&mut buf).expect("ok"), Some(cancel()));
        assert_eq!(codec.decode(&mut buf).expect("ok"), None);
    }
}
