//! Length-prefixed binary framing for registry-described messages.
//!
//! Frame layout: `[int32 LE length][int32 LE typeId][field*]`, where field 0
//! is always the correlation envelope. Works over any AsyncRead/AsyncWrite
//! through `FramedRead`/`FramedWrite`.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::registry::{ENVELOPE_FIELD_ID, Message, SerializerRegistry};
use super::wire::{self, FieldValue};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;
const TYPE_ID_LEN: usize = 4;

/// Per-channel request/response correlation id. 0 means "no reply expected".
pub type CorrelationId = u32;

/// A decoded frame: the message plus its dispatch envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: CorrelationId,
    pub message: Message,
}

impl Frame {
    pub fn new(correlation_id: CorrelationId, message: Message) -> Self {
        Self {
            correlation_id,
            message,
        }
    }

    pub fn uncorrelated(message: Message) -> Self {
        Self::new(0, message)
    }
}

#[derive(Debug)]
pub enum DecodeStatus {
    Frame { frame: Frame, consumed: usize },
    /// Total bytes the buffer must hold before the next attempt can succeed.
    NeedMoreData { needed: usize },
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    registry: Arc<SerializerRegistry>,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<SerializerRegistry>) -> Self {
        Self {
            registry,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn registry(&self) -> &Arc<SerializerRegistry> {
        &self.registry
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Append one complete frame to `dst`.
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let shape = self.registry.resolve(frame.message.type_id())?;

        let mut body = BytesMut::with_capacity(64);
        body.put_i32_le(frame.message.type_id() as i32);
        wire::encode_field(
            ENVELOPE_FIELD_ID,
            &FieldValue::Int32(frame.correlation_id as i32),
            &mut body,
        )?;
        shape.encode_fields(frame.message.fields(), &mut body)?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        tracing::trace!(
            type_id = frame.message.type_id(),
            correlation_id = frame.correlation_id,
            frame_size_bytes = body.len(),
            "Encoding frame"
        );

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_i32_le(body.len() as i32);
        dst.extend_from_slice(&body);
        Ok(())
    }

    /// Try to decode the next frame at the front of `src` without consuming
    /// anything. Safe to call again after more bytes arrive.
    pub fn try_decode_next(&self, src: &[u8]) -> Result<DecodeStatus, ProtocolError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(DecodeStatus::NeedMoreData {
                needed: LENGTH_PREFIX,
            });
        }
        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if length < 0 {
            return Err(ProtocolError::corrupt(format!("negative frame length {length}")));
        }
        let length = length as usize;
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        if length < TYPE_ID_LEN {
            return Err(ProtocolError::corrupt(format!(
                "frame length {length} cannot hold a type id"
            )));
        }
        let total = LENGTH_PREFIX + length;
        if src.len() < total {
            return Ok(DecodeStatus::NeedMoreData { needed: total });
        }

        let mut payload = &src[LENGTH_PREFIX..total];
        let raw_type = payload.get_i32_le();
        if raw_type < 0 {
            return Err(ProtocolError::corrupt(format!("negative type id {raw_type}")));
        }
        let shape = self.registry.resolve(raw_type as u32)?;

        let mut decoded = wire::decode_fields(payload)?;
        let correlation_id = match decoded.remove(ENVELOPE_FIELD_ID) {
            Some(FieldValue::Int32(id)) => id as CorrelationId,
            Some(other) => {
                return Err(ProtocolError::corrupt(format!(
                    "envelope field arrived as {:?}",
                    other.kind()
                )));
            }
            None => 0,
        };
        let fields = shape.decode_fields(decoded)?;

        Ok(DecodeStatus::Frame {
            frame: Frame::new(correlation_id, Message::new(shape.type_id, fields)),
            consumed: total,
        })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.try_decode_next(src)? {
            DecodeStatus::Frame { frame, consumed } => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            DecodeStatus::NeedMoreData { needed } => {
                // Only ever reserve the remainder of the current frame.
                src.reserve(needed.saturating_sub(src.len()));
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::corrupt(format!(
                "stream ended with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(&item, dst)
    }
}
