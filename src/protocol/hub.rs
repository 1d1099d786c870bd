//! Hub/spoke relay.
//!
//! The invoker reaches remote implementors only through [`Relay`]. [`Hub`]
//! implements it on top of a [`Messenger`] and keeps an explicit table of which
//! remote node implements which endpoint. The table is fed by `HasImplementor`
//! and `NoLongerHasImplementor` broadcasts; a client bootstraps it from the
//! server with `InitRequest`/`Init` and the server announces departures with
//! `NodeRemoved`.

use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{Node, RpcMessage};
use crate::service::{MessageListener, Messenger};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Narrow view of the network used by the invoker
pub trait Relay: Send + Sync {
    fn local_node(&self) -> Node;

    /// Remote nodes that implement `endpoint`
    fn implementors_of(&self, endpoint: &str) -> Vec<Node>;

    fn route_call(&self, node: &Node, message: RpcMessage) -> Result<()>;

    /// The local node gained its first implementor of `endpoint`.
    fn endpoint_available(&self, endpoint: &str);

    /// The local node lost its last implementor of `endpoint`.
    fn endpoint_retired(&self, endpoint: &str);
}

#[derive(Default)]
struct HubState {
    remote: HashMap<Node, BTreeSet<String>>,
    local: BTreeSet<String>,
    initialized: bool,
}

/// Messenger-backed relay with a table of remote endpoint locations
pub struct Hub {
    messenger: Arc<dyn Messenger>,
    state: Mutex<HubState>,
    initialized: Condvar,
}

impl Hub {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        let state = HubState {
            initialized: messenger.is_server(),
            ..HubState::default()
        };
        Self {
            messenger,
            state: Mutex::new(state),
            initialized: Condvar::new(),
        }
    }

    /// Ask the server for its endpoint table and wait until it arrives.
    ///
    /// Returns at once on the server. Blocks the calling thread.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        if self.messenger.is_server() {
            return Ok(());
        }

        self.messenger
            .send(&self.messenger.server_node(), RpcMessage::InitRequest)?;

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.initialized {
            if self.initialized.wait_until(&mut state, deadline).timed_out() {
                return if state.initialized {
                    Ok(())
                } else {
                    Err(ProtocolError::Timeout)
                };
            }
        }
        Ok(())
    }

    /// Remote endpoint table snapshot
    pub fn remote_endpoints(&self) -> HashMap<Node, BTreeSet<String>> {
        self.state.lock().remote.clone()
    }

    fn forget_node(&self, node: &Node) {
        if self.state.lock().remote.remove(node).is_some() {
            debug!(node = %node, "Removed node from endpoint table");
        }
    }

    fn announce(&self, message: RpcMessage) {
        if let Err(e) = self.messenger.broadcast(message) {
            warn!(error = %e, "Failed to announce endpoint change");
        }
    }

    fn reply_init(&self, requester: &Node) {
        let local = self.messenger.local_node();
        let snapshot = {
            let state = self.state.lock();
            let mut entries: Vec<(Node, Vec<String>)> = state
                .remote
                .iter()
                .filter(|(node, _)| *node != requester)
                .map(|(node, names)| (node.clone(), names.iter().cloned().collect()))
                .collect();
            if !state.local.is_empty() {
                entries.push((local, state.local.iter().cloned().collect()));
            }
            entries
        };

        if let Err(e) = self.messenger.send(
            requester,
            RpcMessage::Init {
                nodes_with_implementors: snapshot,
            },
        ) {
            warn!(node = %requester, error = %e, "Failed to send endpoint table");
        }
    }
}

impl Relay for Hub {
    fn local_node(&self) -> Node {
        self.messenger.local_node()
    }

    fn implementors_of(&self, endpoint: &str) -> Vec<Node> {
        let local = self.messenger.local_node();
        self.state
            .lock()
            .remote
            .iter()
            .filter(|(node, names)| **node != local && names.contains(endpoint))
            .map(|(node, _)| node.clone())
            .collect()
    }

    fn route_call(&self, node: &Node, message: RpcMessage) -> Result<()> {
        self.messenger.send(node, message)
    }

    fn endpoint_available(&self, endpoint: &str) {
        self.state.lock().local.insert(endpoint.to_string());
        self.announce(RpcMessage::HasImplementor {
            endpoint: endpoint.to_string(),
        });
    }

    fn endpoint_retired(&self, endpoint: &str) {
        self.state.lock().local.remove(endpoint);
        self.announce(RpcMessage::NoLongerHasImplementor {
            endpoint: endpoint.to_string(),
        });
    }
}

impl MessageListener for Hub {
    fn message_received(&self, message: &RpcMessage, from: &Node) {
        match message {
            RpcMessage::HasImplementor { endpoint } => {
                self.state
                    .lock()
                    .remote
                    .entry(from.clone())
                    .or_default()
                    .insert(endpoint.clone());
            }
            RpcMessage::NoLongerHasImplementor { endpoint } => {
                let mut state = self.state.lock();
                if let Some(names) = state.remote.get_mut(from) {
                    names.remove(endpoint);
                    if names.is_empty() {
                        state.remote.remove(from);
                    }
                }
            }
            RpcMessage::InitRequest if self.messenger.is_server() => self.reply_init(from),
            RpcMessage::Init {
                nodes_with_implementors,
            } => {
                let local = self.messenger.local_node();
                let mut state = self.state.lock();
                for (node, names) in nodes_with_implementors {
                    if *node == local {
                        continue;
                    }
                    state
                        .remote
                        .entry(node.clone())
                        .or_default()
                        .extend(names.iter().cloned());
                }
                state.initialized = true;
                self.initialized.notify_all();
                info!(nodes = state.remote.len(), "Endpoint table synchronized");
            }
            RpcMessage::NodeRemoved { node } => self.forget_node(node),
            _ => {}
        }
    }

    fn connection_removed(&self, node: &Node) {
        self.forget_node(node);
        if self.messenger.is_server() {
            self.announce(RpcMessage::NodeRemoved { node: node.clone() });
        }
    }
}
