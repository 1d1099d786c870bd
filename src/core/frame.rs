//! Frame header arithmetic and resumable outbound frames.
//!
//! The header is the body size XORed with [`MAGIC`]. Sizes fit in the low 24 bits,
//! so the top byte of every valid header equals the top byte of `MAGIC`; anything
//! else on the wire is cross-protocol garbage and is rejected before a single
//! byte of body buffer is reserved.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sentinel mixed into every header
pub const MAGIC: u32 = 0x9B00_0000;

/// Bits of the header that carry the size
pub const SIZE_MASK: u32 = 0x00FF_FFFF;

/// Bits of the header that carry the tag
pub const TAG_MASK: u32 = !SIZE_MASK;

/// Default upper bound on a frame body (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Length of the size header in bytes
pub const HEADER_LEN: usize = 4;

/// Compute the header for a body of `size` bytes.
#[inline]
pub fn encode_header(size: usize) -> u32 {
    (size as u32) ^ MAGIC
}

/// Validate a received header and return the body size it announces.
///
/// Checks the tag first, then `1 <= size <= max`.
pub fn validate_header(header: u32, max: usize) -> Result<usize> {
    if header & TAG_MASK != MAGIC {
        return Err(ProtocolError::InvalidMagic(header));
    }

    let size = (header ^ MAGIC) as usize;
    if size == 0 {
        return Err(ProtocolError::InvalidFrameSize(size));
    }
    if size > max {
        return Err(ProtocolError::OversizedFrame(size));
    }
    Ok(size)
}

/// Check a body length against `max` before a header is produced for it.
pub fn check_body_len(len: usize, max: usize) -> Result<()> {
    if len == 0 {
        return Err(ProtocolError::InvalidFrameSize(0));
    }
    if len > max || len > SIZE_MASK as usize {
        return Err(ProtocolError::OversizedFrame(len));
    }
    Ok(())
}

/// An encoded frame waiting to be flushed.
///
/// Cloning shares the body, which lets one encoding be relayed to many channels;
/// each clone keeps its own cursor.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    header: [u8; HEADER_LEN],
    body: Bytes,
    cursor: usize,
}

impl OutboundFrame {
    /// Wrap an encoded body. Fails if the body is empty or larger than `max`.
    pub fn new(body: impl Into<Bytes>, max: usize) -> Result<Self> {
        let body = body.into();
        check_body_len(body.len(), max)?;
        Ok(Self {
            header: encode_header(body.len()).to_be_bytes(),
            body,
            cursor: 0,
        })
    }

    /// Total bytes on the wire, header included
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Bytes still to be written
    pub fn remaining(&self) -> usize {
        self.wire_len() - self.cursor
    }

    /// True once every byte has been written
    pub fn is_flushed(&self) -> bool {
        self.cursor >= self.wire_len()
    }

    /// Frame body without the header
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Write whatever is left, resuming from the cursor.
    ///
    /// The cursor advances after every partial write, so if this future is
    /// dropped midway a later call carries on where the last one stopped.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        while !self.is_flushed() {
            let chunk = if self.cursor < HEADER_LEN {
                &self.header[self.cursor..]
            } else {
                &self.body[self.cursor - HEADER_LEN..]
            };
            let n = writer.write(chunk).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.cursor += n;
            written += n;
        }
        writer.flush().await?;
        Ok(written)
    }
}
