//! # RPC Invoker
//!
//! Location-transparent calls on named endpoints.
//!
//! The invoker owns the local [`EndpointRegistry`], the table of pending remote
//! calls and the worker pool that runs inbound calls. Remote nodes are reached
//! only through a [`Relay`].
//!
//! ## Call Semantics
//! - [`Invoker::invoke`]: fire-and-forget, delivered to every implementor
//! - [`Invoker::invoke_and_wait`]: exactly one implementor must exist; blocks the
//!   calling thread until the result, the target's departure, or transport loss
//!
//! `invoke_and_wait` blocks and must not be called from inside an async task.
//!
//! ## Example
//! ```rust,no_run
//! use nodewire::config::DispatchConfig;
//! use nodewire::protocol::dispatcher::{CallContext, Capability, Operations};
//! use nodewire::protocol::envelope::RemoteCall;
//! use nodewire::protocol::invoker::Invoker;
//! use std::sync::Arc;
//!
//! struct Greeter;
//! impl Capability for Greeter {
//!     fn operations() -> Operations<Self> {
//!         Operations::new("greeter").register("greet", |_: &Greeter, _ctx: &CallContext, name: String| {
//!             Ok(format!("hello {name}"))
//!         })
//!     }
//! }
//!
//! let invoker = Invoker::new(&DispatchConfig::default())?;
//! invoker.add_implementor("greeter", Arc::new(Greeter), false)?;
//! let reply: String = invoker.call(RemoteCall::new("greeter", "greet", &"ann".to_string())?)?;
//! # Ok::<(), nodewire::error::ProtocolError>(())
//! ```

use crate::config::DispatchConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{identity_of, Bound, CallContext, Capability};
use crate::protocol::endpoint::Endpoint;
use crate::protocol::envelope::{CallId, CallIdGenerator, Invoke, Node, RemoteCall, RpcMessage};
use crate::protocol::hub::{Hub, Relay};
use crate::protocol::pending::PendingCalls;
use crate::protocol::registry::EndpointRegistry;
use crate::service::{MessageListener, Messenger};
use crate::utils::metrics::global_metrics;
use crate::utils::worker_pool::WorkerPool;
use serde::de::DeserializeOwned;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Relay of an invoker that is not attached to any network
struct Standalone {
    node: Node,
}

impl Relay for Standalone {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    fn implementors_of(&self, _endpoint: &str) -> Vec<Node> {
        Vec::new()
    }

    fn route_call(&self, node: &Node, _message: RpcMessage) -> Result<()> {
        Err(ProtocolError::UnknownNode(node.to_string()))
    }

    fn endpoint_available(&self, _endpoint: &str) {}

    fn endpoint_retired(&self, _endpoint: &str) {}
}

struct InvokerInner {
    registry: EndpointRegistry,
    pending: PendingCalls,
    call_ids: CallIdGenerator,
    pool: WorkerPool,
    relay: Arc<dyn Relay>,
}

/// Where a wait-for-result call will run
enum Target {
    Local(Arc<Endpoint>),
    Remote(Node),
}

/// Handle to a node's endpoint registry and RPC machinery. Cheap to clone.
#[derive(Clone)]
pub struct Invoker {
    inner: Arc<InvokerInner>,
}

impl Invoker {
    /// Invoker for local calls only.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let node = Node::new("local", SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        Self::with_relay(Arc::new(Standalone { node }), config)
    }

    /// Invoker that reaches remote nodes through `relay`.
    pub fn with_relay(relay: Arc<dyn Relay>, config: &DispatchConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(InvokerInner {
                registry: EndpointRegistry::new(),
                pending: PendingCalls::new(),
                call_ids: CallIdGenerator::new(),
                pool: WorkerPool::new("rpc-worker", config.worker_threads)?,
                relay,
            }),
        })
    }

    /// Wire an invoker to a connected messenger.
    ///
    /// Builds a [`Hub`] over the messenger, subscribes both to it and, on a
    /// client, waits up to `config.init_timeout` for the server's endpoint
    /// table. Blocks the calling thread.
    pub fn attach(messenger: Arc<dyn Messenger>, config: &DispatchConfig) -> Result<Self> {
        let hub = Arc::new(Hub::new(Arc::clone(&messenger)));
        let invoker = Self::with_relay(hub.clone(), config)?;

        messenger.add_listener(hub.clone());
        messenger.add_listener(Arc::new(invoker.clone()));
        hub.synchronize(config.init_timeout)?;

        debug!(node = %messenger.local_node(), "Invoker attached");
        Ok(invoker)
    }

    pub fn local_node(&self) -> Node {
        self.inner.relay.local_node()
    }

    /// Register `implementor` on `endpoint`.
    ///
    /// The first implementor of an endpoint is announced to peers.
    #[instrument(skip(self, implementor))]
    pub fn add_implementor<T: Capability>(
        &self,
        endpoint: &str,
        implementor: Arc<T>,
        single_threaded: bool,
    ) -> Result<()> {
        let bound = Arc::new(Bound::new(implementor));
        if self.inner.registry.add(endpoint, bound, single_threaded)? {
            self.inner.relay.endpoint_available(endpoint);
        }
        Ok(())
    }

    /// Unregister `implementor` from `endpoint`.
    ///
    /// Fails with `UnknownImplementor` if it was not registered. Retiring the last
    /// implementor is announced to peers.
    #[instrument(skip(self, implementor))]
    pub fn remove_implementor<T: Capability>(&self, endpoint: &str, implementor: &Arc<T>) -> Result<()> {
        if self.inner.registry.remove(endpoint, identity_of(implementor))? {
            self.inner.relay.endpoint_retired(endpoint);
        }
        Ok(())
    }

    /// Fire-and-forget call to every implementor of `call.endpoint`.
    ///
    /// Local work runs on the worker pool; failures are logged only.
    pub fn invoke(&self, call: RemoteCall) {
        let remote = self.inner.relay.implementors_of(&call.endpoint);
        for node in &remote {
            let message = RpcMessage::Invoke(Invoke {
                call_id: None,
                need_reply: false,
                call: call.clone(),
            });
            match self.inner.relay.route_call(node, message) {
                Ok(()) => global_metrics().call_remote(),
                Err(e) => {
                    warn!(endpoint = %call.endpoint, node = %node, error = %e, "Dropped fire-and-forget call")
                }
            }
        }

        match self.inner.registry.get(&call.endpoint) {
            Some(endpoint) => {
                let sender = self.local_node();
                self.inner.dispatch_inbound(endpoint, sender, None, call);
            }
            None if remote.is_empty() => {
                debug!(endpoint = %call.endpoint, "No implementors, call dropped");
            }
            None => {}
        }
    }

    /// Call the single implementor of `call.endpoint` and wait for its result.
    pub fn invoke_and_wait(&self, call: RemoteCall) -> Result<Vec<u8>> {
        let result = match self.inner.single_target(&call.endpoint)? {
            Target::Local(endpoint) => self.inner.call_local(endpoint, call),
            Target::Remote(node) => self.inner.call_remote(node, call),
        };
        if result.is_err() {
            global_metrics().call_failed();
        }
        result
    }

    /// [`invoke_and_wait`](Self::invoke_and_wait) and decode the output as `R`.
    pub fn call<R: DeserializeOwned>(&self, call: RemoteCall) -> Result<R> {
        let bytes = self.invoke_and_wait(call)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn has_single_implementor(&self, endpoint: &str) -> bool {
        self.inner.implementor_total(endpoint) == 1
    }

    /// Node of the single implementor of `endpoint`.
    pub fn get_single_implementor(&self, endpoint: &str) -> Result<Node> {
        match self.inner.single_target(endpoint)? {
            Target::Local(_) => Ok(self.local_node()),
            Target::Remote(node) => Ok(node),
        }
    }

    /// Fail every pending remote call and refuse new ones.
    pub fn transport_lost(&self, reason: &str) -> usize {
        self.inner.pending.fail_all(reason)
    }

    /// Remote calls waiting for a result
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Names of the endpoints with local implementors
    pub fn local_endpoints(&self) -> Vec<String> {
        self.inner.registry.names()
    }
}

impl InvokerInner {
    fn implementor_total(&self, endpoint: &str) -> usize {
        self.registry.local_count(endpoint) + self.relay.implementors_of(endpoint).len()
    }

    fn single_target(&self, endpoint: &str) -> Result<Target> {
        pick_target(
            endpoint,
            self.registry.get(endpoint),
            self.relay.implementors_of(endpoint),
        )
    }

    fn call_local(&self, endpoint: Arc<Endpoint>, call: RemoteCall) -> Result<Vec<u8>> {
        global_metrics().call_local();
        let ctx = CallContext {
            sender: self.relay.local_node(),
        };
        let ticket = endpoint.take_ticket();
        let target = Arc::clone(&endpoint);
        let results = ticket.call(move || target.invoke_local(&ctx, &call))?;
        single_result(&endpoint, results)
    }

    fn call_remote(&self, node: Node, call: RemoteCall) -> Result<Vec<u8>> {
        global_metrics().call_remote();
        let call_id = self.call_ids.next_id();
        let reply = self.pending.register(call_id, node.clone())?;

        let message = RpcMessage::Invoke(Invoke {
            call_id: Some(call_id),
            need_reply: true,
            call,
        });
        if let Err(e) = self.relay.route_call(&node, message) {
            self.pending.cancel(call_id);
            return Err(e);
        }

        reply
            .blocking_recv()
            .map_err(|_| ProtocolError::InvocationFailed(constants::ERR_REPLY_DROPPED.to_string()))?
    }

    /// Take a ticket now, run the call on the pool in ticket order.
    fn dispatch_inbound(
        self: &Arc<Self>,
        endpoint: Arc<Endpoint>,
        sender: Node,
        reply_to: Option<CallId>,
        call: RemoteCall,
    ) {
        let ticket = endpoint.take_ticket();
        let inner = Arc::clone(self);

        let queued = self.pool.execute(move || {
            let target = Arc::clone(ticket.endpoint());
            ticket.run(move || {
                global_metrics().call_local();
                let ctx = CallContext {
                    sender: sender.clone(),
                };
                let results = target.invoke_local(&ctx, &call);

                match reply_to {
                    Some(call_id) => {
                        inner.reply(&sender, call_id, single_result(&target, results));
                    }
                    None => {
                        for e in results.into_iter().filter_map(|r| r.err()) {
                            global_metrics().call_failed();
                            warn!(endpoint = %call.endpoint, operation = %call.operation, error = %e, "Fire-and-forget call failed");
                        }
                    }
                }
            });
        });

        if let Err(e) = queued {
            error!(error = %e, "Failed to queue inbound call");
        }
    }

    fn reply(&self, to: &Node, call_id: CallId, result: Result<Vec<u8>>) {
        let result = result.map_err(ProtocolError::to_wire);
        if let Err(e) = self
            .relay
            .route_call(to, RpcMessage::Results { call_id, result })
        {
            warn!(node = %to, %call_id, error = %e, "Failed to return call result");
        }
    }

    fn handle_invoke(self: &Arc<Self>, invoke: &Invoke, from: &Node) {
        let reply_to = if invoke.need_reply { invoke.call_id } else { None };

        match self.registry.get(&invoke.call.endpoint) {
            Some(endpoint) => {
                self.dispatch_inbound(endpoint, from.clone(), reply_to, invoke.call.clone());
            }
            None => {
                debug!(endpoint = %invoke.call.endpoint, node = %from, "Call for unknown endpoint");
                if let Some(call_id) = reply_to {
                    self.reply(
                        from,
                        call_id,
                        Err(ProtocolError::RemoteNotFound(invoke.call.endpoint.clone())),
                    );
                }
            }
        }
    }
}

/// Choose where a wait-for-result call goes.
///
/// The endpoint handle may outlive its last implementor, so the decision rests on
/// one reading of the local count rather than on the handle being present.
fn pick_target(name: &str, local: Option<Arc<Endpoint>>, mut remote: Vec<Node>) -> Result<Target> {
    let local_count = local.as_ref().map_or(0, |e| e.implementor_count());

    match (local_count, remote.len(), local) {
        (0, 0, _) => Err(ProtocolError::RemoteNotFound(name.to_string())),
        (1, 0, Some(endpoint)) => Ok(Target::Local(endpoint)),
        (0, 1, _) => Ok(Target::Remote(remote.swap_remove(0))),
        (l, r, _) => Err(ProtocolError::InconsistentTopology {
            endpoint: name.to_string(),
            implementors: l + r,
        }),
    }
}

/// Collapse the per-implementor results of a wait-for-result call.
fn single_result(endpoint: &Endpoint, mut results: Vec<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match results.len() {
        0 => Err(ProtocolError::RemoteNotFound(endpoint.name().to_string())),
        1 => results.remove(0),
        n => Err(ProtocolError::InconsistentTopology {
            endpoint: endpoint.name().to_string(),
            implementors: n,
        }),
    }
}

impl MessageListener for Invoker {
    fn message_received(&self, message: &RpcMessage, from: &Node) {
        match message {
            RpcMessage::Invoke(invoke) => self.inner.handle_invoke(invoke, from),
            RpcMessage::Results { call_id, result } => {
                self.inner
                    .pending
                    .resolve(*call_id, result.clone().map_err(ProtocolError::from));
            }
            RpcMessage::NodeRemoved { node } => {
                self.inner.pending.fail_for_node(node);
            }
            _ => {}
        }
    }

    fn connection_removed(&self, node: &Node) {
        self.inner.pending.fail_for_node(node);
    }

    fn messenger_failed(&self, error: &ProtocolError) {
        let failed = self.inner.pending.fail_all(&error.to_string());
        warn!(error = %error, failed, "Messenger failed");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::protocol::dispatcher::Operations;
    use parking_lot::Mutex;

    struct Store {
        items: Mutex<Vec<String>>,
    }

    impl Capability for Store {
        fn operations() -> Operations<Self> {
            Operations::new("store")
                .register("put", |s: &Store, _ctx: &CallContext, item: String| {
                    s.items.lock().push(item);
                    Ok(s.items.lock().len())
                })
                .register("fail", |_: &Store, _ctx: &CallContext, _: ()| -> Result<()> {
                    Err(ProtocolError::Custom("nope".into()))
                })
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            worker_threads: 2,
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn test_local_call_round_trip() {
        let invoker = Invoker::new(&config()).unwrap();
        let store = Arc::new(Store {
            items: Mutex::new(Vec::new()),
        });
        invoker.add_implementor("store", store.clone(), true).unwrap();

        let n: usize = invoker
            .call(RemoteCall::new("store", "put", &"a".to_string()).unwrap())
            .unwrap();
        assert_eq!(n, 1);
        assert!(invoker.has_single_implementor("store"));
        assert_eq!(invoker.get_single_implementor("store").unwrap(), invoker.local_node());
    }

    #[test]
    fn test_implementor_error_is_a_value() {
        let invoker = Invoker::new(&config()).unwrap();
        invoker
            .add_implementor("store", Arc::new(Store { items: Mutex::new(Vec::new()) }), false)
            .unwrap();
        let result = invoker.invoke_and_wait(RemoteCall::new("store", "fail", &()).unwrap());
        assert!(matches!(result, Err(ProtocolError::Custom(_))));
    }

    fn far() -> Node {
        Node::new("far", "127.0.0.1:4100".parse().unwrap())
    }

    #[test]
    fn test_emptied_endpoint_handle_routes_to_remote() {
        // Last local implementor removed after the handle was fetched.
        let emptied = Arc::new(Endpoint::new("store", Store::operations().contract(), false));

        match pick_target("store", Some(emptied.clone()), vec![far()]).unwrap() {
            Target::Remote(node) => assert_eq!(node, far()),
            Target::Local(_) => panic!("empty endpoint chosen"),
        }
        assert!(matches!(
            pick_target("store", Some(emptied), Vec::new()),
            Err(ProtocolError::RemoteNotFound(_))
        ));
    }

    #[test]
    fn test_local_and_remote_counts_add_up() {
        let endpoint = Arc::new(Endpoint::new("store", Store::operations().contract(), false));
        endpoint.add(Arc::new(Bound::new(Arc::new(Store {
            items: Mutex::new(Vec::new()),
        }))));

        assert!(matches!(
            pick_target("store", Some(endpoint.clone()), Vec::new()),
            Ok(Target::Local(_))
        ));
        assert!(matches!(
            pick_target("store", Some(endpoint), vec![far()]),
            Err(ProtocolError::InconsistentTopology { implementors: 2, .. })
        ));
        assert!(matches!(
            pick_target("store", None, vec![far(), far()]),
            Err(ProtocolError::InconsistentTopology { implementors: 2, .. })
        ));
    }

    #[test]
    fn test_remove_retires_endpoint() {
        let invoker = Invoker::new(&config()).unwrap();
        let store = Arc::new(Store {
            items: Mutex::new(Vec::new()),
        });
        invoker.add_implementor("store", store.clone(), false).unwrap();
        invoker.remove_implementor("store", &store).unwrap();
        assert!(invoker.local_endpoints().is_empty());
        assert!(matches!(
            invoker.remove_implementor("store", &store),
            Err(ProtocolError::UnknownImplementor(_))
        ));
    }
}
