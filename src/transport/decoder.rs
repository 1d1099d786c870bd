//! The decode loop.
//!
//! One task turns inbound frames into envelopes. Frames of a quarantined channel
//! drive that channel's login conversation; frames of a promoted channel must
//! name their sender and go to the socket listener. A failure while handling one
//! frame fails only that frame's channel.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{Envelope, Payload};
use crate::protocol::handshake::{Directive, QuarantineConversation};
use crate::transport::reader::InboundEvent;
use crate::transport::socket::{ChannelSink, SocketInner};
use crate::transport::ChannelId;
use crate::utils::metrics::global_metrics;
use bytes::BytesMut;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub(crate) fn spawn_decoder(
    mut events: mpsc::Receiver<InboundEvent>,
    socket: Weak<SocketInner>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(inner) = socket.upgrade() else { break };
            process(&inner, event);
        }
        debug!("Decoder stopped");
    })
}

pub(crate) fn process(inner: &SocketInner, event: InboundEvent) {
    match event {
        InboundEvent::Frame(channel, frame) => {
            if let Err(e) = process_frame(inner, channel, frame) {
                inner.fail(channel, e);
            }
        }
        InboundEvent::Closed(channel, error) => {
            inner.fail(channel, error.unwrap_or(ProtocolError::ConnectionClosed));
        }
    }
}

fn process_frame(inner: &SocketInner, channel: ChannelId, frame: BytesMut) -> Result<()> {
    let envelope = Envelope::from_bytes(&frame)?;

    let conversation = inner.quarantine.lock().remove(&channel);
    if let Some(conversation) = conversation {
        return quarantine_step(inner, channel, conversation, envelope).inspect_err(|_| {
            global_metrics().handshake_failed();
        });
    }

    if !inner.is_live(channel) {
        trace!(channel, "Frame for closed channel dropped");
        return Ok(());
    }

    envelope.sender()?;
    if let Some(listener) = inner.listener.upgrade() {
        listener.message_received(channel, envelope);
    }
    Ok(())
}

fn quarantine_step(
    inner: &SocketInner,
    channel: ChannelId,
    mut conversation: Box<dyn QuarantineConversation>,
    envelope: Envelope,
) -> Result<()> {
    let Payload::Handshake(message) = envelope.payload else {
        warn!(channel, "RPC message from quarantined channel");
        return Err(ProtocolError::UnexpectedMessage);
    };

    let sink = ChannelSink::new(inner, channel);
    match conversation.message_received(message, &sink) {
        Directive::None => {
            inner.quarantine.lock().insert(channel, conversation);
            Ok(())
        }
        Directive::Unquarantine => {
            let promotion = conversation.promotion().ok_or_else(|| {
                ProtocolError::HandshakeError("promoted without identities".to_string())
            })?;
            global_metrics().handshake_success();
            info!(channel, local = %promotion.local, remote = %promotion.remote, "Channel unquarantined");
            if let Some(listener) = inner.listener.upgrade() {
                listener.socket_unquarantined(channel, promotion);
            }
            Ok(())
        }
        Directive::Terminate => Err(conversation.take_failure().unwrap_or_else(|| {
            ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_TERMINATED.to_string())
        })),
    }
}
