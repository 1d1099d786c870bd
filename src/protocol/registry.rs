use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Implementor;
use crate::protocol::endpoint::Endpoint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name → endpoint map of this node.
///
/// Endpoints are created on first registration and retired when their last
/// implementor leaves. The map lock is never held while an endpoint runs calls.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementor. Returns `true` if it is the endpoint's first.
    pub fn add(
        &self,
        name: &str,
        implementor: Arc<dyn Implementor>,
        single_threaded: bool,
    ) -> Result<bool> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(endpoint = name, single_threaded, "Endpoint created");
                Arc::new(Endpoint::new(
                    name,
                    implementor.contract().clone(),
                    single_threaded,
                ))
            })
            .clone();

        if let Some(reason) = endpoint.contract().mismatch(implementor.contract()) {
            return Err(ProtocolError::CapabilityMismatch {
                endpoint: name.to_string(),
                reason,
            });
        }
        if endpoint.is_single_threaded() != single_threaded {
            return Err(ProtocolError::CapabilityMismatch {
                endpoint: name.to_string(),
                reason: format!(
                    "endpoint is {}",
                    if endpoint.is_single_threaded() {
                        "single-threaded"
                    } else {
                        "multi-threaded"
                    }
                ),
            });
        }

        let was_empty = endpoint.implementor_count() == 0;
        endpoint.add(implementor);
        Ok(was_empty)
    }

    /// Remove an implementor by identity. Returns `true` if the endpoint was retired.
    pub fn remove(&self, name: &str, identity: usize) -> Result<bool> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownImplementor(name.to_string()))?;

        let left = endpoint
            .remove(identity)
            .ok_or_else(|| ProtocolError::UnknownImplementor(name.to_string()))?;

        if left == 0 {
            endpoints.remove(name);
            debug!(endpoint = name, "Endpoint retired");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(name).cloned()
    }

    /// Local implementor count for `name`
    pub fn local_count(&self, name: &str) -> usize {
        self.get(name).map_or(0, |e| e.implementor_count())
    }

    pub fn names(&self) -> Vec<String> {
        self.endpoints.lock().keys().cloned().collect()
    }
}
