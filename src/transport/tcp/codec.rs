use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::RpcError;

/// Length prefix size: a 4-byte big-endian body length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum body size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Splits a byte stream into length-prefixed frame bodies.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬──────────────────────────┐
/// │ Length (4B BE)   │ UTF-8 JSON body          │
/// └──────────────────┴──────────────────────────┘
/// ```
///
/// The codec only frames; bodies are decoded by the dispatch loop so that a malformed
/// body can be skipped without losing the stream position. A frame whose length prefix
/// exceeds `max_frame_size` is discarded as it arrives and decoding resumes after it.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Bytes of a discarded frame still to be dropped.
    skip: usize,
}

impl FrameCodec {
    /// `max_frame_size` is capped at what the 4-byte prefix can express.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
            skip: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

fn too_large(size: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        RpcError::FrameTooLarge { size, max },
    )
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.skip > 0 {
                let dropped = self.skip.min(buf.len());
                buf.advance(dropped);
                self.skip -= dropped;
                if self.skip > 0 {
                    return Ok(None);
                }
            }

            if buf.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let mut prefix = &buf[..LENGTH_PREFIX_SIZE];
            let body_len = prefix.get_u32() as usize;

            if body_len > self.max_frame_size {
                let err = RpcError::FrameTooLarge {
                    size: body_len,
                    max: self.max_frame_size,
                };
                warn!(error = %err, "Discarding oversized frame");
                buf.advance(LENGTH_PREFIX_SIZE);
                self.skip = body_len;
                continue;
            }

            let frame_len = LENGTH_PREFIX_SIZE + body_len;
            if buf.len() < frame_len {
                buf.reserve(frame_len - buf.len());
                return Ok(None);
            }

            buf.advance(LENGTH_PREFIX_SIZE);
            return Ok(Some(buf.split_to(body_len).freeze()));
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, body: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let len = match u32::try_from(body.len()) {
            Ok(len) if body.len() <= self.max_frame_size => len,
            _ => return Err(too_large(body.len(), self.max_frame_size)),
        };

        buf.reserve(LENGTH_PREFIX_SIZE + body.len());
        buf.put_u32(len);
        buf.put(body);
        Ok(())
    }
}

/// Serialize a packet into a frame body.
pub fn encode_body<T: Serialize>(packet: &T) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(packet)?))
}
