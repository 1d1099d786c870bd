use crate::core::frame::OutboundFrame;
use crate::error::Result;
use crate::protocol::envelope::Envelope;

/// Serialize an envelope into a frame ready for the writer queue.
pub fn encode_envelope(envelope: &Envelope, max_frame_size: usize) -> Result<OutboundFrame> {
    let body = envelope.to_bytes()?;
    OutboundFrame::new(body, max_frame_size)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::frame::HEADER_LEN;
    use crate::error::ProtocolError;
    use crate::protocol::envelope::HandshakeMessage;

    #[test]
    fn test_encoded_body_decodes() {
        let env = Envelope::handshake(HandshakeMessage::Name("zed".into()));
        let frame = encode_envelope(&env, 1024).unwrap();
        assert_eq!(frame.wire_len(), HEADER_LEN + frame.body().len());

        let back = Envelope::from_bytes(frame.body()).unwrap();
        assert!(back.from.is_none());
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let env = Envelope::handshake(HandshakeMessage::Name("z".repeat(64)));
        assert!(matches!(
            encode_envelope(&env, 16),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }
}
