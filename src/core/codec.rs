use crate::core::frame::{check_body_len, encode_header, validate_header, HEADER_LEN, MAX_FRAME_SIZE};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Tokio codec for `[size ^ MAGIC][body]` frames.
///
/// Decoding is two-phase: the header is read and validated first, and the
/// announced size is remembered so partial bodies spread over many reads do
/// not re-parse the header.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    pending: Option<usize>,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let size = match self.pending {
            Some(size) => size,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                // Reject before reserving anything sized from the header.
                let size = validate_header(header, self.max_frame_size)?;
                src.advance(HEADER_LEN);
                self.pending = Some(size);
                size
            }
        };

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(src.split_to(size)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_body_len(body.len(), self.max_frame_size)?;
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(encode_header(body.len()));
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::frame::MAGIC;

    #[test]
    fn test_partial_header_and_body() {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello world"), &mut wire)
            .unwrap();

        let mut src = BytesMut::new();
        let mut decoded = None;
        for byte in wire.iter() {
            src.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut src).unwrap() {
                decoded = Some(frame);
            }
        }
        assert_eq!(&decoded.unwrap()[..], b"hello world");
    }

    #[test]
    fn test_bad_tag_does_not_reserve() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::with_capacity(8);
        // 0x7FFFFFFF ^ MAGIC would be a huge size if the tag were not checked.
        src.put_u32(0x7FFF_FFFF);
        let capacity = src.capacity();

        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::InvalidMagic(0x7FFF_FFFF))
        ));
        assert_eq!(src.capacity(), capacity);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        src.put_u32(MAGIC);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::InvalidFrameSize(0))
        ));
    }

    #[test]
    fn test_encode_respects_limit() {
        let mut codec = FrameCodec::new(16);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from(vec![1u8; 17]), &mut dst),
            Err(ProtocolError::OversizedFrame(17))
        ));
        assert!(dst.is_empty());
    }
}
