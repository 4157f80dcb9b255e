//! Newline framing for the inter-node envelope.

use super::message::{Message, ProtoError};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const MAX_FRAME: usize = 8 * 1024 * 1024;

/// EnvelopeCodec implements tokio's `Decoder` and `Encoder` traits for the
/// control port: one serialized [`Message`] per newline-terminated frame.
pub struct EnvelopeCodec {
    // Next index to examine for a '\n'; avoids rescanning the buffer prefix
    // when a frame arrives in several reads.
    next_index: usize,
    max_frame: usize,
}

impl EnvelopeCodec {
    /// A codec with the default frame cap (8 MiB, sized for merge dumps).
    pub fn new() -> Self {
        EnvelopeCodec {
            next_index: 0,
            max_frame: MAX_FRAME,
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        EnvelopeCodec::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Message;
    type Error = ProtoError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') {
            let frame_end = self.next_index + offset;
            let line = buf.split_to(frame_end + 1);
            self.next_index = 0;
            let msg = serde_json::from_slice(&line[..line.len() - 1]).map_err(ProtoError::Decode)?;
            Ok(Some(msg))
        } else if buf.len() > self.max_frame {
            Err(ProtoError::FrameTooLong(buf.len()))
        } else {
            self.next_index = buf.len();
            Ok(None)
        }
    }
}

impl Encoder<Message> for EnvelopeCodec {
    type Error = ProtoError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let raw = serde_json::to_vec(&msg).map_err(ProtoError::Encode)?;
        buf.reserve(raw.len() + 1);
        buf.put_slice(&raw);
        buf.put_u8(b'\n');
        Ok(())
    }
}
