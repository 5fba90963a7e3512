use crate::core::ber;
use crate::error::{LdapError, Result};
use crate::protocol::message::LdapMessage;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default ceiling on a single frame
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frames `LDAPMessage`s on a byte stream.
///
/// A frame is one complete outer BER TLV. Decoding waits until the whole
/// TLV has arrived; a malformed header or an oversized declared length is an
/// error and the stream must be discarded.
#[derive(Debug, Clone)]
pub struct LdapCodec {
    max_message_size: usize,
}

impl Default for LdapCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl LdapCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Decoder for LdapCodec {
    type Item = LdapMessage;
    type Error = LdapError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LdapMessage>> {
        let frame_len = match ber::peek_frame_len(src)? {
            Some(len) => len,
            None => return Ok(None),
        };

        if frame_len > self.max_message_size {
            return Err(LdapError::OversizedMessage(frame_len));
        }

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let msg = LdapMessage::from_bytes(&frame)?;
        trace!(
            message_id = msg.message_id,
            op = msg.op.name(),
            frame_len,
            "Decoded frame"
        );
        Ok(Some(msg))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LdapMessage>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.has_remaining() => Err(LdapError::TransportError(format!(
                "stream closed with {} bytes of a partial frame",
                src.remaining()
            ))),
            None => Ok(None),
        }
    }
}

impl Encoder<LdapMessage> for LdapCodec {
    type Error = LdapError;

    fn encode(&mut self, item: LdapMessage, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&LdapMessage>>::encode(self, &item, dst)
    }
}

impl<'a> Encoder<&'a LdapMessage> for LdapCodec {
    type Error = LdapError;

    fn encode(&mut self, item: &'a LdapMessage, dst: &mut BytesMut) -> Result<()> {
        if item.message_id < 0 {
            return Err(LdapError::Encoding(format!(
                "negative message ID {}",
                item.message_id
            )));
        }
        let bytes = item.to_bytes();
        if bytes.len() > self.max_message_size {
            return Err(LdapError::OversizedMessage(bytes.len()));
        }
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
