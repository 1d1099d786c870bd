//! Client messenger: one spoke of the star.
//!
//! Connects to the server, runs the client side of the login conversation and
//! then sends every envelope through the server, which relays it.

use crate::config::NetworkConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{Envelope, Node, Payload, RpcMessage};
use crate::protocol::handshake::{ClientConversation, ClientLogin, Promotion};
use crate::service::{MessageListener, Messenger};
use crate::transport::{ChannelId, Socket, SocketListener};
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
struct Session {
    local: Node,
    server: Node,
    channel: ChannelId,
}

type LoginReply = oneshot::Sender<Result<Session>>;

struct ClientInner {
    socket: Socket,
    session: Mutex<Option<Session>>,
    login: Mutex<Option<LoginReply>>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
}

/// Connecting side of the network
pub struct ClientMessenger {
    inner: Arc<ClientInner>,
    session: Session,
}

impl ClientMessenger {
    /// Connect to `config.client.address` and log in.
    ///
    /// Resolves once the server has promoted the connection, or fails with the
    /// server's rejection reason as `HandshakeRejected`.
    #[instrument(skip(config, login), fields(address = %config.client.address, name = %config.client.name))]
    pub async fn connect(config: &NetworkConfig, login: Arc<dyn ClientLogin>) -> Result<Self> {
        config.validate_strict()?;

        let address = config.client.address.clone();
        let stream = with_timeout_error(
            async { TcpStream::connect(&address).await.map_err(ProtocolError::from) },
            config.client.connection_timeout,
        )
        .await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = stream.peer_addr()?;

        let (reply, logged_in) = oneshot::channel();
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let socket_listener: Weak<dyn SocketListener> = weak.clone();
            ClientInner {
                socket: Socket::new(socket_listener, &config.transport),
                session: Mutex::new(None),
                login: Mutex::new(Some(reply)),
                listeners: RwLock::new(Vec::new()),
            }
        });

        let conversation =
            ClientConversation::new(config.client.name.clone(), config.client.mac.clone(), login);
        if let Err(e) = inner.socket.add(stream, peer, Box::new(conversation)) {
            inner.socket.shutdown(SHUTDOWN_TIMEOUT);
            return Err(e);
        }

        let outcome = with_timeout_error(
            async {
                logged_in
                    .await
                    .unwrap_or(Err(ProtocolError::ConnectionClosed))
            },
            config.client.handshake_timeout,
        )
        .await;

        match outcome {
            Ok(session) => {
                info!(local = %session.local, server = %session.server, "Logged in");
                Ok(Self { inner, session })
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                // The acknowledgement of a rejection is still queued.
                inner.socket.shutdown(SHUTDOWN_TIMEOUT);
                Err(e)
            }
        }
    }

    /// Close the connection and detach all listeners.
    ///
    /// Listeners get `messenger_failed` first, so calls still waiting on the
    /// server fail instead of hanging.
    pub fn shut_down(&self) {
        if self.inner.session.lock().take().is_none() {
            return;
        }
        self.inner.socket.shutdown(SHUTDOWN_TIMEOUT);

        let listeners = std::mem::take(&mut *self.inner.listeners.write());
        let error = ProtocolError::TransportLost("client shut down".to_string());
        for listener in &listeners {
            listener.messenger_failed(&error);
        }
        info!(local = %self.session.local, "Client shut down");
    }

    fn send_envelope(&self, to: Option<Node>, message: RpcMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::TransportLost(constants::ERR_TRANSPORT_LOST.to_string()));
        }
        let envelope = Envelope::rpc(self.session.local.clone(), to, message);
        self.inner.socket.send(self.session.channel, &envelope)
    }
}

impl ClientInner {
    fn listeners(&self) -> Vec<Arc<dyn MessageListener>> {
        self.listeners.read().clone()
    }
}

impl SocketListener for ClientInner {
    fn message_received(&self, _channel: ChannelId, envelope: Envelope) {
        let Payload::Rpc(message) = &envelope.payload else {
            return;
        };
        let Ok(sender) = envelope.sender() else {
            return;
        };
        for listener in self.listeners() {
            listener.message_received(message, sender);
        }
    }

    fn socket_unquarantined(&self, channel: ChannelId, promotion: Promotion) {
        let session = Session {
            local: promotion.local,
            server: promotion.remote,
            channel,
        };
        *self.session.lock() = Some(session.clone());
        if let Some(reply) = self.login.lock().take() {
            let _ = reply.send(Ok(session));
        }
    }

    fn socket_error(&self, _channel: ChannelId, error: ProtocolError) {
        if let Some(reply) = self.login.lock().take() {
            let _ = reply.send(Err(error));
            return;
        }

        let Some(session) = self.session.lock().take() else {
            return;
        };
        warn!(server = %session.server, error = %error, "Lost connection to server");

        let lost = ProtocolError::TransportLost(format!(
            "{}: {}",
            constants::ERR_TRANSPORT_LOST,
            error
        ));
        for listener in self.listeners() {
            listener.connection_removed(&session.server);
            listener.messenger_failed(&lost);
        }
    }
}

impl Messenger for ClientMessenger {
    fn local_node(&self) -> Node {
        self.session.local.clone()
    }

    fn server_node(&self) -> Node {
        self.session.server.clone()
    }

    fn is_server(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    fn send(&self, to: &Node, message: RpcMessage) -> Result<()> {
        self.send_envelope(Some(to.clone()), message)
    }

    /// Relayed by the server to every other node.
    fn broadcast(&self, message: RpcMessage) -> Result<()> {
        self.send_envelope(None, message)
    }

    fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.inner.listeners.write().push(listener);
    }
}
