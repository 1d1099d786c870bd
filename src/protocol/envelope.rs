//! Wire messages carried inside frames.
//!
//! Every frame holds exactly one bincode-encoded [`Envelope`]. During quarantine
//! the payload is a [`HandshakeMessage`]; afterwards it is an [`RpcMessage`] and
//! the sender must be set.

use crate::error::{ProtocolError, RemoteError, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A peer on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: SocketAddr,
}

impl Node {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// One frame's worth of content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Option<Node>,
    /// `None` addresses every node
    pub to: Option<Node>,
    pub payload: Payload,
}

impl Envelope {
    pub fn handshake(message: HandshakeMessage) -> Self {
        Self {
            from: None,
            to: None,
            payload: Payload::Handshake(message),
        }
    }

    pub fn rpc(from: Node, to: Option<Node>, message: RpcMessage) -> Self {
        Self {
            from: Some(from),
            to,
            payload: Payload::Rpc(message),
        }
    }

    /// The sender, or `MissingSender` for an anonymous envelope.
    pub fn sender(&self) -> Result<&Node> {
        self.from.as_ref().ok_or(ProtocolError::MissingSender)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Handshake(HandshakeMessage),
    Rpc(RpcMessage),
}

/// Messages exchanged while a connection is quarantined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Candidate name, client to server
    Name(String),
    /// Hashed machine identifier, client to server
    Mac(String),
    /// Challenge issued by the login verifier; `None` without a verifier
    Challenge(Option<HashMap<String, String>>),
    /// Client answer to the challenge
    Response(HashMap<String, String>),
    /// `None` on success, otherwise the rejection reason
    LoginResult(Option<String>),
    Welcome {
        assigned_name: String,
        server_name: String,
        reset_hint: Option<String>,
    },
    /// Address pair as seen by the server
    Addresses {
        client: SocketAddr,
        server: SocketAddr,
    },
    /// Client acknowledgement of a rejection
    Ack,
}

/// Messages exchanged between logged-in nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    Invoke(Invoke),
    Results {
        call_id: CallId,
        result: std::result::Result<Vec<u8>, RemoteError>,
    },
    HasImplementor {
        endpoint: String,
    },
    NoLongerHasImplementor {
        endpoint: String,
    },
    /// Sent by a new client to ask for the hub's endpoint table
    InitRequest,
    Init {
        nodes_with_implementors: Vec<(Node, Vec<String>)>,
    },
    NodeRemoved {
        node: Node,
    },
}

/// A call on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoke {
    /// Present only when a reply is awaited
    pub call_id: Option<CallId>,
    pub need_reply: bool,
    pub call: RemoteCall,
}

/// Endpoint name, operation selector and encoded argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub endpoint: String,
    pub operation: String,
    pub arg_types: Vec<String>,
    pub args: Vec<u8>,
}

impl RemoteCall {
    /// Build a call whose argument is `args`, encoded with bincode.
    pub fn new<A: Serialize>(endpoint: &str, operation: &str, args: &A) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            arg_types: vec![std::any::type_name::<A>().to_string()],
            args: bincode::serialize(args)?,
        })
    }

    /// Decode the argument as `A`.
    pub fn decode_args<A: DeserializeOwned>(&self) -> Result<A> {
        Ok(bincode::deserialize(&self.args)?)
    }
}

/// Correlation id of a wait-for-result call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub u128);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Generates ids that are unique across invokers: a random prefix per generator
/// followed by a counter.
#[derive(Debug)]
pub struct CallIdGenerator {
    prefix: u64,
    counter: AtomicU64,
}

impl CallIdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: rand::rng().random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> CallId {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        CallId(((self.prefix as u128) << 64) | count as u128)
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn node(name: &str) -> Node {
        Node::new(name, "127.0.0.1:3300".parse().unwrap())
    }

    #[test]
    fn test_missing_sender() {
        let env = Envelope::handshake(HandshakeMessage::Ack);
        assert!(matches!(env.sender(), Err(ProtocolError::MissingSender)));
    }

    #[test]
    fn test_rpc_envelope_bytes() {
        let call = RemoteCall::new("chat", "say", &("hi".to_string(), 3u32)).unwrap();
        let env = Envelope::rpc(
            node("a"),
            None,
            RpcMessage::Invoke(Invoke {
                call_id: None,
                need_reply: false,
                call: call.clone(),
            }),
        );
        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(back.sender().unwrap(), &node("a"));
        match back.payload {
            Payload::Rpc(RpcMessage::Invoke(invoke)) => {
                assert_eq!(invoke.call, call);
                let (text, n): (String, u32) = invoke.call.decode_args().unwrap();
                assert_eq!((text.as_str(), n), ("hi", 3));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_failed_results_envelope_bytes() {
        let env = Envelope::rpc(
            node("server"),
            Some(node("a")),
            RpcMessage::Results {
                call_id: CallIdGenerator::new().next_id(),
                result: Err(RemoteError::TransportLost("gone".into())),
            },
        );
        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        match back.payload {
            Payload::Rpc(RpcMessage::Results { result, .. }) => {
                assert_eq!(result, Err(RemoteError::TransportLost("gone".into())));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_call_ids_unique() {
        let ids = CallIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(a.0 >> 64, b.0 >> 64);
    }
}
