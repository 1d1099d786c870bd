//! Server messenger: the hub of the star.
//!
//! Accepts TCP connections, logs them in through a [`ServerConversation`] and
//! relays envelopes between logged-in clients. Envelopes addressed to the
//! server, and broadcasts, are also delivered to the local listeners.

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, RemoteError, Result};
use crate::protocol::envelope::{Envelope, Invoke, Node, Payload, RpcMessage};
use crate::protocol::handshake::{
    unique_name, LoginVerifier, Promotion, ServerConversation, SessionDirectory,
};
use crate::service::{MessageListener, Messenger};
use crate::transport::{ChannelId, Socket, SocketListener};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Default)]
struct Sessions {
    by_channel: HashMap<ChannelId, Node>,
    by_node: HashMap<Node, ChannelId>,
}

struct ServerInner {
    node: Node,
    socket: Socket,
    verifier: Option<Arc<dyn LoginVerifier>>,
    sessions: Mutex<Sessions>,
    /// Last machine id per node name, kept after the node leaves
    macs: Mutex<HashMap<String, String>>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    accepting: AtomicBool,
    max_connections: usize,
    /// How long queued frames may keep flushing after `shut_down`
    shutdown_grace: Duration,
    shutdown: CancellationToken,
}

/// Listening side of the network
pub struct ServerMessenger {
    inner: Arc<ServerInner>,
}

impl ServerMessenger {
    /// Bind the listen address and start accepting connections.
    #[instrument(skip(config, verifier), fields(address = %config.server.address))]
    pub async fn bind(
        config: &NetworkConfig,
        verifier: Option<Arc<dyn LoginVerifier>>,
    ) -> Result<Self> {
        config.validate_strict()?;

        let listener = TcpListener::bind(&config.server.address).await?;
        let address = listener.local_addr()?;
        let node = Node::new(config.server.name.clone(), address);

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let socket_listener: Weak<dyn SocketListener> = weak.clone();
            ServerInner {
                node,
                socket: Socket::new(socket_listener, &config.transport),
                verifier,
                sessions: Mutex::new(Sessions::default()),
                macs: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                accepting: AtomicBool::new(config.server.accept_new_connections),
                max_connections: config.server.max_connections,
                shutdown_grace: config.server.shutdown_timeout,
                shutdown: CancellationToken::new(),
            }
        });

        tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
        ));
        info!(node = %inner.node, "Server listening");
        Ok(Self { inner })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.inner.node.address
    }

    /// Logged-in nodes
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.sessions.lock().by_node.keys().cloned().collect()
    }

    /// Last machine id seen for `name`, also after that node has left.
    pub fn player_mac(&self, name: &str) -> Option<String> {
        self.inner.macs.lock().get(name).cloned()
    }

    pub fn set_accept_new_connections(&self, accept: bool) {
        self.inner.accepting.store(accept, Ordering::SeqCst);
        info!(accept, "Accept new connections");
    }

    pub fn accepts_new_connections(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Disconnect a logged-in node. Returns false for an unknown node.
    pub fn remove_connection(&self, node: &Node) -> bool {
        let channel = self.inner.sessions.lock().by_node.get(node).copied();
        match channel {
            Some(channel) => {
                info!(node = %node, "Removing connection");
                self.inner.socket.close(channel);
                true
            }
            None => false,
        }
    }

    /// Stop accepting, drop every connection and detach all listeners.
    ///
    /// Frames already queued keep flushing in the background for at most
    /// `server.shutdown_timeout`.
    pub fn shut_down(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();
        inner.socket.shutdown(inner.shutdown_grace);
        *inner.sessions.lock() = Sessions::default();

        let listeners = std::mem::take(&mut *inner.listeners.write());
        let error = ProtocolError::TransportLost("server shut down".to_string());
        for listener in &listeners {
            listener.messenger_failed(&error);
        }
        info!(node = %inner.node, "Server shut down");
    }
}

async fn accept_loop(listener: TcpListener, server: Weak<ServerInner>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(server) = server.upgrade() else { break };
                server.admit(stream, peer);
            }
            Err(e) => {
                error!(error = %e, "Error accepting connection");
            }
        }
    }
    debug!("Accept loop stopped");
}

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(peer = %peer, "Not accepting new connections");
            return;
        }
        if self.socket.channel_count() >= self.max_connections {
            warn!(peer = %peer, max = self.max_connections, "Connection limit reached");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let directory: Arc<dyn SessionDirectory> = Arc::clone(self) as Arc<dyn SessionDirectory>;
        let conversation =
            ServerConversation::new(peer, self.node.address, self.verifier.clone(), directory);
        match self.socket.add(stream, peer, Box::new(conversation)) {
            Ok(channel) => info!(peer = %peer, channel, "New connection in quarantine"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to add connection"),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn MessageListener>> {
        self.listeners.read().clone()
    }

    fn deliver(&self, message: &RpcMessage, from: &Node) {
        for listener in self.listeners() {
            listener.message_received(message, from);
        }
    }

    fn channel_of(&self, node: &Node) -> Option<ChannelId> {
        self.sessions.lock().by_node.get(node).copied()
    }

    /// Forward `envelope` to every logged-in channel except `except`.
    fn fan_out(&self, envelope: &Envelope, except: Option<ChannelId>) -> Result<()> {
        let frame = self.socket.encode(envelope)?;
        let channels: Vec<ChannelId> = self
            .sessions
            .lock()
            .by_channel
            .keys()
            .copied()
            .filter(|channel| Some(*channel) != except)
            .collect();

        for channel in channels {
            if let Err(e) = self.socket.send_frame(channel, frame.clone()) {
                debug!(channel, error = %e, "Broadcast skipped channel");
            }
        }
        Ok(())
    }

    fn relay(&self, channel: ChannelId, envelope: Envelope) {
        let Ok(sender) = envelope.sender().cloned() else {
            return;
        };

        match envelope.to.clone() {
            None => {
                if let Err(e) = self.fan_out(&envelope, Some(channel)) {
                    warn!(from = %sender, error = %e, "Failed to relay broadcast");
                }
                if let Payload::Rpc(message) = &envelope.payload {
                    self.deliver(message, &sender);
                }
            }
            Some(target) if target == self.node => {
                if let Payload::Rpc(message) = &envelope.payload {
                    self.deliver(message, &sender);
                }
            }
            Some(target) => match self.channel_of(&target) {
                Some(target_channel) => {
                    if let Err(e) = self.socket.send(target_channel, &envelope) {
                        debug!(to = %target, error = %e, "Relay failed");
                    }
                }
                None => self.unknown_target(&sender, &target, &envelope.payload),
            },
        }
    }

    /// A waiting caller gets a failure back; anything else is dropped.
    fn unknown_target(&self, sender: &Node, target: &Node, payload: &Payload) {
        debug!(from = %sender, to = %target, "Dropping message for unknown node");
        if let Payload::Rpc(RpcMessage::Invoke(Invoke {
            call_id: Some(call_id),
            ..
        })) = payload
        {
            let reply = RpcMessage::Results {
                call_id: *call_id,
                result: Err(RemoteError::TransportLost(format!(
                    "{}: {}",
                    constants::ERR_NODE_LEFT,
                    target
                ))),
            };
            if let Err(e) = self.send_to(sender, reply) {
                debug!(to = %sender, error = %e, "Failed to report unknown target");
            }
        }
    }

    fn send_to(&self, to: &Node, message: RpcMessage) -> Result<()> {
        if *to == self.node {
            self.deliver(&message, &self.node);
            return Ok(());
        }
        let channel = self
            .channel_of(to)
            .ok_or_else(|| ProtocolError::UnknownNode(to.to_string()))?;
        self.socket.send(
            channel,
            &Envelope::rpc(self.node.clone(), Some(to.clone()), message),
        )
    }
}

impl SessionDirectory for ServerInner {
    fn server_node(&self) -> Node {
        self.node.clone()
    }

    fn unique_name(&self, candidate: &str) -> String {
        let sessions = self.sessions.lock();
        unique_name(candidate, |name| {
            name.eq_ignore_ascii_case(&self.node.name)
                || sessions
                    .by_node
                    .keys()
                    .any(|node| node.name.eq_ignore_ascii_case(name))
        })
    }

    fn login_succeeded(&self, node: &Node, mac: &str) {
        self.macs.lock().insert(node.name.clone(), mac.to_string());
    }
}

impl SocketListener for ServerInner {
    fn message_received(&self, channel: ChannelId, envelope: Envelope) {
        let expected = self.sessions.lock().by_channel.get(&channel).cloned();
        let Some(expected) = expected else {
            debug!(channel, "Message from unknown channel dropped");
            return;
        };

        match envelope.sender() {
            Ok(sender) if *sender == expected => self.relay(channel, envelope),
            Ok(sender) => {
                let error = ProtocolError::UnexpectedSender {
                    expected: expected.to_string(),
                    actual: sender.to_string(),
                };
                self.socket.fail(channel, error);
            }
            Err(e) => self.socket.fail(channel, e),
        }
    }

    fn socket_unquarantined(&self, channel: ChannelId, promotion: Promotion) {
        let node = promotion.remote;
        {
            let mut sessions = self.sessions.lock();
            sessions.by_channel.insert(channel, node.clone());
            sessions.by_node.insert(node.clone(), channel);
        }
        info!(node = %node, channel, "Node logged in");

        for listener in self.listeners() {
            listener.connection_added(&node);
        }
    }

    fn socket_error(&self, channel: ChannelId, error: ProtocolError) {
        let node = {
            let mut sessions = self.sessions.lock();
            let node = sessions.by_channel.remove(&channel);
            if let Some(node) = &node {
                sessions.by_node.remove(node);
            }
            node
        };

        match node {
            Some(node) => {
                info!(node = %node, error = %error, "Node disconnected");
                for listener in self.listeners() {
                    listener.connection_removed(&node);
                }
            }
            None => debug!(channel, error = %error, "Quarantined connection dropped"),
        }
    }
}

impl Messenger for ServerMessenger {
    fn local_node(&self) -> Node {
        self.inner.node.clone()
    }

    fn server_node(&self) -> Node {
        self.inner.node.clone()
    }

    fn is_server(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    fn send(&self, to: &Node, message: RpcMessage) -> Result<()> {
        self.inner.send_to(to, message)
    }

    fn broadcast(&self, message: RpcMessage) -> Result<()> {
        let envelope = Envelope::rpc(self.inner.node.clone(), None, message);
        self.inner.fan_out(&envelope, None)
    }

    fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.listeners.write().push(listener);
    }
}
