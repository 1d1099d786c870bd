//! # Service Layer
//!
//! Server and client messengers: the node glue between the socket layer and
//! the RPC layer.
//!
//! A messenger owns one [`Socket`](crate::transport::socket::Socket), runs the
//! login conversations of its connections, and delivers RPC messages of
//! logged-in nodes to its [`MessageListener`]s. The server relays envelopes
//! between clients, making it the hub of a star topology.

pub mod client;
pub mod server;

use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{Node, RpcMessage};
use std::sync::Arc;

pub use client::ClientMessenger;
pub use server::ServerMessenger;

/// Node-level send/receive seam used by the hub and the invoker
pub trait Messenger: Send + Sync {
    fn local_node(&self) -> Node;

    /// The hub's node; the local node on the server
    fn server_node(&self) -> Node;

    fn is_server(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Send to one node
    fn send(&self, to: &Node, message: RpcMessage) -> Result<()>;

    /// Send to every other node
    fn broadcast(&self, message: RpcMessage) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn MessageListener>);
}

/// Receives RPC messages and connection events from a messenger.
///
/// Callbacks run on the decoder task and must not block.
pub trait MessageListener: Send + Sync {
    fn message_received(&self, message: &RpcMessage, from: &Node);

    fn connection_added(&self, _node: &Node) {}

    fn connection_removed(&self, _node: &Node) {}

    /// The messenger can no longer reach the network.
    fn messenger_failed(&self, _error: &ProtocolError) {}
}
