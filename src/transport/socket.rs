//! Socket: the set of connections of one messenger.
//!
//! A socket owns one writer task, one decoder task and a reader task per
//! connection. Every connection starts quarantined with a login conversation;
//! promotion, messages and failures are reported to a [`SocketListener`].

use crate::config::TransportConfig;
use crate::core::frame::OutboundFrame;
use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{Envelope, HandshakeMessage};
use crate::protocol::handshake::{Directive, HandshakeSink, Promotion, QuarantineConversation};
use crate::transport::decoder::spawn_decoder;
use crate::transport::encoder::encode_envelope;
use crate::transport::reader::spawn_reader;
use crate::transport::writer::{spawn_writer, WriterHandle};
use crate::transport::ChannelId;
use crate::utils::metrics::global_metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Receives everything a socket learns about its channels.
///
/// Callbacks run on the decoder or writer task and must not block.
pub trait SocketListener: Send + Sync {
    /// An envelope from a promoted channel; the sender is always set.
    fn message_received(&self, channel: ChannelId, envelope: Envelope);

    /// The channel's login conversation ended in promotion.
    fn socket_unquarantined(&self, channel: ChannelId, promotion: Promotion);

    /// The channel is gone. Reported exactly once per channel.
    fn socket_error(&self, channel: ChannelId, error: ProtocolError);
}

struct ChannelState {
    peer: SocketAddr,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct SocketInner {
    writer: WriterHandle,
    inbound: mpsc::Sender<crate::transport::reader::InboundEvent>,
    pub(crate) quarantine: Mutex<HashMap<ChannelId, Box<dyn QuarantineConversation>>>,
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
    next_channel: AtomicU64,
    pub(crate) listener: Weak<dyn SocketListener>,
    max_frame_size: usize,
    shutdown: CancellationToken,
}

impl SocketInner {
    pub(crate) fn is_live(&self, channel: ChannelId) -> bool {
        self.channels.lock().contains_key(&channel)
    }

    fn send_envelope(&self, channel: ChannelId, envelope: &Envelope) -> Result<()> {
        let frame = encode_envelope(envelope, self.max_frame_size)?;
        self.writer.enqueue(channel, frame)
    }

    /// Tear a channel down and report `error` once.
    pub(crate) fn fail(&self, channel: ChannelId, error: ProtocolError) {
        let Some(state) = self.channels.lock().remove(&channel) else {
            return;
        };
        if self.quarantine.lock().remove(&channel).is_some() {
            global_metrics().handshake_failed();
        }

        self.writer.close(channel);
        if let Some(reader) = state.reader {
            reader.abort();
        }
        global_metrics().connection_closed();

        if error.is_protocol_violation() {
            global_metrics().protocol_error();
            warn!(channel, peer = %state.peer, error = %error, "Protocol violation, channel closed");
        } else {
            debug!(channel, peer = %state.peer, error = %error, "Channel closed");
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.socket_error(channel, error);
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.writer.shutdown(Duration::ZERO);
        for (_, state) in self.channels.get_mut().drain() {
            if let Some(reader) = state.reader {
                reader.abort();
            }
        }
    }
}

/// Sends handshake messages on one channel
pub(crate) struct ChannelSink<'a> {
    inner: &'a SocketInner,
    channel: ChannelId,
}

impl<'a> ChannelSink<'a> {
    pub(crate) fn new(inner: &'a SocketInner, channel: ChannelId) -> Self {
        Self { inner, channel }
    }
}

impl HandshakeSink for ChannelSink<'_> {
    fn send(&self, message: HandshakeMessage) -> Result<()> {
        self.inner
            .send_envelope(self.channel, &Envelope::handshake(message))
    }
}

/// Connection set of one messenger
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Start the writer and decoder tasks. Must be called inside a Tokio runtime.
    pub fn new(listener: Weak<dyn SocketListener>, config: &TransportConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SocketInner>| {
            let target = weak.clone();
            let (writer, _task) = spawn_writer(Box::new(move |channel, error| {
                if let Some(inner) = target.upgrade() {
                    inner.fail(channel, error);
                }
            }));

            let (inbound, events) = mpsc::channel(config.inbound_queue_capacity.max(1));
            let shutdown = CancellationToken::new();
            spawn_decoder(events, weak.clone(), shutdown.clone());

            SocketInner {
                writer,
                inbound,
                quarantine: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                listener,
                max_frame_size: config.max_frame_size,
                shutdown,
            }
        });
        Self { inner }
    }

    /// Add a connection in quarantine and start its conversation.
    #[instrument(skip(self, stream, conversation))]
    pub fn add<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        mut conversation: Box<dyn QuarantineConversation>,
    ) -> Result<ChannelId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(ProtocolError::Shutdown);
        }

        let channel = inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(stream);
        inner.writer.register(channel, Box::new(write_half));
        inner.channels.lock().insert(
            channel,
            ChannelState {
                peer,
                reader: None,
            },
        );
        global_metrics().connection_established();
        global_metrics().handshake_attempt();

        if conversation.start(&ChannelSink::new(inner, channel)) == Directive::Terminate {
            let reason = conversation.take_failure().unwrap_or_else(|| {
                ProtocolError::HandshakeError("conversation refused to start".to_string())
            });
            global_metrics().handshake_failed();
            inner.fail(channel, reason.clone());
            return Err(reason);
        }
        inner.quarantine.lock().insert(channel, conversation);

        // The conversation is in place before the first frame can be read.
        let reader = spawn_reader(channel, read_half, inner.max_frame_size, inner.inbound.clone());
        match inner.channels.lock().get_mut(&channel) {
            Some(state) => state.reader = Some(reader),
            None => reader.abort(),
        }

        debug!(channel, "Channel added");
        Ok(channel)
    }

    pub fn send(&self, channel: ChannelId, envelope: &Envelope) -> Result<()> {
        self.inner.send_envelope(channel, envelope)
    }

    /// Queue an already encoded frame. Clones of one frame may go to many channels.
    pub fn send_frame(&self, channel: ChannelId, frame: OutboundFrame) -> Result<()> {
        self.inner.writer.enqueue(channel, frame)
    }

    /// Encode once for [`send_frame`](Self::send_frame) fan-out.
    pub fn encode(&self, envelope: &Envelope) -> Result<OutboundFrame> {
        encode_envelope(envelope, self.inner.max_frame_size)
    }

    /// Close a channel after its queued frames are flushed. Reported as
    /// `ConnectionClosed` to the listener.
    pub fn close(&self, channel: ChannelId) {
        self.fail(channel, ProtocolError::ConnectionClosed);
    }

    /// Close a channel and report `error` for it.
    pub fn fail(&self, channel: ChannelId, error: ProtocolError) {
        self.inner.fail(channel, error);
    }

    pub fn is_quarantined(&self, channel: ChannelId) -> bool {
        self.inner.quarantine.lock().contains_key(&channel)
    }

    pub fn peer_address(&self, channel: ChannelId) -> Option<SocketAddr> {
        self.inner.channels.lock().get(&channel).map(|s| s.peer)
    }

    /// Open channels, quarantined ones included
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size
    }

    /// Stop every task and drop every channel without reporting.
    ///
    /// Frames already queued keep flushing for at most `grace`.
    pub fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.writer.shutdown(grace);

        let channels: Vec<ChannelState> = self
            .inner
            .channels
            .lock()
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in channels {
            if let Some(reader) = state.reader {
                reader.abort();
            }
            global_metrics().connection_closed();
        }
        self.inner.quarantine.lock().clear();
        debug!("Socket shut down");
    }
}
