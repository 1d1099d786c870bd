use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::{CallId, Node};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Wait handle returned for a registered call.
///
/// Synchronous callers wait with `blocking_recv`, which must not run inside an
/// async task.
pub type ReplyReceiver = oneshot::Receiver<Result<Vec<u8>>>;

struct PendingCall {
    target: Node,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

#[derive(Default)]
struct PendingState {
    calls: HashMap<CallId, PendingCall>,
    /// Set once the transport is gone; later registrations fail immediately
    closed: Option<String>,
}

/// Table of wait-for-result calls sent to remote nodes.
///
/// Every entry is resolved exactly once: by its result, by the departure of its
/// target node, or by a blanket transport failure.
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_id: CallId, target: Node) -> Result<ReplyReceiver> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.closed {
            return Err(ProtocolError::TransportLost(reason.clone()));
        }
        let (reply, rx) = oneshot::channel();
        state.calls.insert(call_id, PendingCall { target, reply });
        Ok(rx)
    }

    /// Deliver a result. Returns `false` for unknown or already resolved ids.
    pub fn resolve(&self, call_id: CallId, result: Result<Vec<u8>>) -> bool {
        let entry = self.state.lock().calls.remove(&call_id);
        match entry {
            Some(call) => {
                let _ = call.reply.send(result);
                true
            }
            None => {
                debug!(%call_id, "Result for unknown call dropped");
                false
            }
        }
    }

    /// Forget a call whose request never left this node.
    pub fn cancel(&self, call_id: CallId) {
        self.state.lock().calls.remove(&call_id);
    }

    /// Fail every call waiting on `node`.
    pub fn fail_for_node(&self, node: &Node) -> usize {
        let failed: Vec<PendingCall> = {
            let mut state = self.state.lock();
            let ids: Vec<CallId> = state
                .calls
                .iter()
                .filter(|(_, call)| &call.target == node)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.calls.remove(id)).collect()
        };

        let count = failed.len();
        for call in failed {
            let _ = call.reply.send(Err(ProtocolError::TransportLost(format!(
                "{}: {}",
                constants::ERR_NODE_LEFT,
                node
            ))));
        }
        if count > 0 {
            warn!(node = %node, count, "Failed pending calls of departed node");
        }
        count
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn fail_all(&self, reason: &str) -> usize {
        let failed: Vec<PendingCall> = {
            let mut state = self.state.lock();
            state.closed = Some(reason.to_string());
            state.calls.drain().map(|(_, call)| call).collect()
        };

        let count = failed.len();
        for call in failed {
            let _ = call
                .reply
                .send(Err(ProtocolError::TransportLost(reason.to_string())));
        }
        if count > 0 {
            warn!(count, reason, "Failed all pending calls");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
