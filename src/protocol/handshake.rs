//! Login quarantine conversations.
//!
//! A freshly accepted connection is quarantined: nothing it sends reaches RPC
//! dispatch until its conversation promotes it. The server walks through
//! name, machine id and challenge/response; a rejection is sent and the
//! connection is only terminated after the client acknowledges it, so the
//! reason is never lost to an early close.
//!
//! **Per-Connection State**
//! Each connection owns its conversation value. The decoder feeds it one
//! message at a time and acts on the returned [`Directive`].

use crate::config::MAX_NAME_LENGTH;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{HandshakeMessage, Node};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// What the decoder should do with the connection after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep the connection quarantined and wait for the next message
    None,
    /// Promote the connection to a full session
    Unquarantine,
    /// Close the connection
    Terminate,
}

/// Identities established by a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// This side's node as agreed in the conversation
    pub local: Node,
    /// The peer's node
    pub remote: Node,
}

/// Outbound path for handshake messages on one connection
pub trait HandshakeSink: Send + Sync {
    fn send(&self, message: HandshakeMessage) -> Result<()>;
}

/// One side of a login conversation.
pub trait QuarantineConversation: Send {
    /// Called once when the connection is added. The client side speaks first.
    fn start(&mut self, _sink: &dyn HandshakeSink) -> Directive {
        Directive::None
    }

    /// Feed one message and decide the connection's fate.
    fn message_received(&mut self, message: HandshakeMessage, sink: &dyn HandshakeSink)
        -> Directive;

    /// Available after `Unquarantine` was returned
    fn promotion(&self) -> Option<Promotion>;

    /// Why the conversation ended in `Terminate`, if it knows
    fn take_failure(&mut self) -> Option<ProtocolError> {
        None
    }
}

/// Pluggable credential check.
pub trait LoginVerifier: Send + Sync {
    /// Challenge for this login attempt; `None` when no credentials are needed.
    fn challenge(&self, name: &str, mac: &str, address: SocketAddr)
        -> Option<HashMap<String, String>>;

    /// `None` if the response is acceptable, otherwise the reason to reject.
    fn verify(
        &self,
        name: &str,
        mac: &str,
        address: SocketAddr,
        challenge: Option<&HashMap<String, String>>,
        response: &HashMap<String, String>,
    ) -> Option<String>;

    /// Optional password-reset hint shown to the user after login.
    fn reset_hint(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Server-side view of the connected nodes, used to finish a login.
pub trait SessionDirectory: Send + Sync {
    fn server_node(&self) -> Node;

    /// Name the candidate will actually get.
    fn unique_name(&self, candidate: &str) -> String;

    /// Called exactly once per successful login.
    fn login_succeeded(&self, node: &Node, mac: &str);
}

/// Client-side credential source.
pub trait ClientLogin: Send + Sync {
    fn respond(&self, challenge: Option<&HashMap<String, String>>) -> HashMap<String, String>;
}

/// Answers every challenge with an empty response.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousLogin;

impl ClientLogin for AnonymousLogin {
    fn respond(&self, _challenge: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Reject names that are empty or carry control characters.
pub fn validate_name_format(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some(constants::ERR_NAME_EMPTY.to_string());
    }
    if name.chars().any(char::is_control) {
        return Some(constants::ERR_NAME_CONTROL_CHARS.to_string());
    }
    None
}

/// Pick the name a candidate will log in with.
///
/// Names are cut to [`MAX_NAME_LENGTH`] characters and names shorter than two
/// characters are padded. A case-insensitive clash with `is_taken` appends
/// `" (n)"` with the lowest free `n`.
pub fn unique_name<F>(candidate: &str, is_taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut name: String = candidate.chars().take(MAX_NAME_LENGTH).collect();
    if name.chars().count() < 2 {
        name = format!("aa{name}");
    }
    if !is_taken(&name) {
        return name;
    }
    let mut suffix = 1u32;
    loop {
        let renamed = format!("{name} ({suffix})");
        if !is_taken(&renamed) {
            return renamed;
        }
        suffix += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStep {
    ReadName,
    ReadMac,
    Challenge,
    AckError,
}

/// Server side of the login conversation
pub struct ServerConversation {
    step: ServerStep,
    name: Option<String>,
    mac: Option<String>,
    challenge: Option<HashMap<String, String>>,
    remote_address: SocketAddr,
    local_address: SocketAddr,
    verifier: Option<Arc<dyn LoginVerifier>>,
    directory: Arc<dyn SessionDirectory>,
    promotion: Option<Promotion>,
}

impl ServerConversation {
    pub fn new(
        remote_address: SocketAddr,
        local_address: SocketAddr,
        verifier: Option<Arc<dyn LoginVerifier>>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Self {
        Self {
            step: ServerStep::ReadName,
            name: None,
            mac: None,
            challenge: None,
            remote_address,
            local_address,
            verifier,
            directory,
            promotion: None,
        }
    }

    /// Machine id sent by the client, once known
    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    fn step(&mut self, message: HandshakeMessage, sink: &dyn HandshakeSink) -> Result<Directive> {
        match (self.step, message) {
            (ServerStep::ReadName, HandshakeMessage::Name(candidate)) => {
                self.name = Some(candidate.trim().to_string());
                self.step = ServerStep::ReadMac;
                Ok(Directive::None)
            }
            (ServerStep::ReadMac, HandshakeMessage::Mac(mac)) => {
                let name = self.name.as_deref().unwrap_or_default();
                self.challenge = self
                    .verifier
                    .as_ref()
                    .and_then(|v| v.challenge(name, &mac, self.remote_address));
                self.mac = Some(mac);
                sink.send(HandshakeMessage::Challenge(self.challenge.clone()))?;
                self.step = ServerStep::Challenge;
                Ok(Directive::None)
            }
            (ServerStep::Challenge, HandshakeMessage::Response(response)) => {
                self.finish_login(&response, sink)
            }
            (ServerStep::AckError, HandshakeMessage::Ack) => Ok(Directive::Terminate),
            (step, other) => {
                warn!(?step, message = ?other, "Unexpected message during login");
                Err(ProtocolError::UnexpectedMessage)
            }
        }
    }

    fn finish_login(
        &mut self,
        response: &HashMap<String, String>,
        sink: &dyn HandshakeSink,
    ) -> Result<Directive> {
        let name = self.name.clone().unwrap_or_default();
        let mac = self.mac.clone().unwrap_or_default();

        let error = validate_name_format(&name).or_else(|| {
            self.verifier.as_ref().and_then(|v| {
                v.verify(
                    &name,
                    &mac,
                    self.remote_address,
                    self.challenge.as_ref(),
                    response,
                )
            })
        });

        if let Some(error) = error {
            debug!(name = %name, reason = %error, "Login rejected, waiting for ack");
            sink.send(HandshakeMessage::LoginResult(Some(error)))?;
            self.step = ServerStep::AckError;
            return Ok(Directive::None);
        }

        let assigned = self.directory.unique_name(&name);
        let server = self.directory.server_node();
        let reset_hint = self.verifier.as_ref().and_then(|v| v.reset_hint(&assigned));

        sink.send(HandshakeMessage::LoginResult(None))?;
        sink.send(HandshakeMessage::Welcome {
            assigned_name: assigned.clone(),
            server_name: server.name.clone(),
            reset_hint,
        })?;
        sink.send(HandshakeMessage::Addresses {
            client: self.remote_address,
            server: self.local_address,
        })?;

        let remote = Node::new(assigned, self.remote_address);
        self.directory.login_succeeded(&remote, &mac);
        self.promotion = Some(Promotion {
            local: server,
            remote,
        });
        Ok(Directive::Unquarantine)
    }
}

impl QuarantineConversation for ServerConversation {
    #[instrument(skip(self, message, sink), fields(peer = %self.remote_address))]
    fn message_received(
        &mut self,
        message: HandshakeMessage,
        sink: &dyn HandshakeSink,
    ) -> Directive {
        match self.step(message, sink) {
            Ok(directive) => directive,
            Err(e) => {
                warn!(error = %e, "Login conversation failed");
                Directive::Terminate
            }
        }
    }

    fn promotion(&self) -> Option<Promotion> {
        self.promotion.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStep {
    AwaitChallenge,
    AwaitResult,
    AwaitWelcome,
    AwaitAddresses,
    Done,
}

/// Client side of the login conversation
pub struct ClientConversation {
    step: ClientStep,
    name: String,
    mac: String,
    login: Arc<dyn ClientLogin>,
    assigned_name: Option<String>,
    server_name: Option<String>,
    reset_hint: Option<String>,
    promotion: Option<Promotion>,
    failure: Option<ProtocolError>,
}

impl ClientConversation {
    pub fn new(name: impl Into<String>, mac: impl Into<String>, login: Arc<dyn ClientLogin>) -> Self {
        Self {
            step: ClientStep::AwaitChallenge,
            name: name.into(),
            mac: mac.into(),
            login,
            assigned_name: None,
            server_name: None,
            reset_hint: None,
            promotion: None,
            failure: None,
        }
    }

    /// Password-reset hint sent by the server, if any
    pub fn reset_hint(&self) -> Option<&str> {
        self.reset_hint.as_deref()
    }

    fn step(&mut self, message: HandshakeMessage, sink: &dyn HandshakeSink) -> Result<Directive> {
        match (self.step, message) {
            (ClientStep::AwaitChallenge, HandshakeMessage::Challenge(challenge)) => {
                sink.send(HandshakeMessage::Response(
                    self.login.respond(challenge.as_ref()),
                ))?;
                self.step = ClientStep::AwaitResult;
                Ok(Directive::None)
            }
            (ClientStep::AwaitResult, HandshakeMessage::LoginResult(Some(error))) => {
                sink.send(HandshakeMessage::Ack)?;
                self.failure = Some(ProtocolError::HandshakeRejected(error));
                self.step = ClientStep::Done;
                Ok(Directive::Terminate)
            }
            (ClientStep::AwaitResult, HandshakeMessage::LoginResult(None)) => {
                self.step = ClientStep::AwaitWelcome;
                Ok(Directive::None)
            }
            (
                ClientStep::AwaitWelcome,
                HandshakeMessage::Welcome {
                    assigned_name,
                    server_name,
                    reset_hint,
                },
            ) => {
                self.assigned_name = Some(assigned_name);
                self.server_name = Some(server_name);
                self.reset_hint = reset_hint;
                self.step = ClientStep::AwaitAddresses;
                Ok(Directive::None)
            }
            (ClientStep::AwaitAddresses, HandshakeMessage::Addresses { client, server }) => {
                let assigned = self.assigned_name.take().unwrap_or_else(|| self.name.clone());
                let server_name = self.server_name.take().unwrap_or_default();
                self.promotion = Some(Promotion {
                    local: Node::new(assigned, client),
                    remote: Node::new(server_name, server),
                });
                self.step = ClientStep::Done;
                Ok(Directive::Unquarantine)
            }
            (step, other) => {
                warn!(?step, message = ?other, "Unexpected message during login");
                Err(ProtocolError::UnexpectedMessage)
            }
        }
    }
}

impl QuarantineConversation for ClientConversation {
    fn start(&mut self, sink: &dyn HandshakeSink) -> Directive {
        let sent = sink
            .send(HandshakeMessage::Name(self.name.clone()))
            .and_then(|_| sink.send(HandshakeMessage::Mac(self.mac.clone())));
        match sent {
            Ok(()) => Directive::None,
            Err(e) => {
                self.failure = Some(ProtocolError::HandshakeError(e.to_string()));
                Directive::Terminate
            }
        }
    }

    #[instrument(skip(self, message, sink), fields(name = %self.name))]
    fn message_received(
        &mut self,
        message: HandshakeMessage,
        sink: &dyn HandshakeSink,
    ) -> Directive {
        match self.step(message, sink) {
            Ok(directive) => directive,
            Err(e) => {
                warn!(error = %e, "Login conversation failed");
                self.failure = Some(ProtocolError::HandshakeError(e.to_string()));
                Directive::Terminate
            }
        }
    }

    fn promotion(&self) -> Option<Promotion> {
        self.promotion.clone()
    }

    fn take_failure(&mut self) -> Option<ProtocolError> {
        self.failure.take()
    }
}
