use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::{Node, RemoteCall};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Explicit per-call context handed to every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Node that issued the call; the local node for local calls
    pub sender: Node,
}

/// Argument and output descriptors of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub argument: String,
    pub output: String,
}

/// Closed set of named operations an endpoint accepts.
///
/// Two contracts are equal when their names and every operation signature match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub name: Cow<'static, str>,
    pub operations: BTreeMap<String, Signature>,
}

impl Contract {
    /// Describe how `self` and `other` differ, or `None` if they agree.
    pub fn mismatch(&self, other: &Contract) -> Option<String> {
        if self.name != other.name {
            return Some(format!(
                "contract {} does not match {}",
                other.name, self.name
            ));
        }
        if self.operations != other.operations {
            return Some(format!("operations of {} differ", self.name));
        }
        None
    }
}

type HandlerFn<T> = dyn Fn(&T, &CallContext, &RemoteCall) -> Result<Vec<u8>> + Send + Sync;

struct Operation<T> {
    signature: Signature,
    handler: Box<HandlerFn<T>>,
}

/// Operation table for implementors of type `T`.
///
/// Handlers are typed at registration; calls are routed by operation name and
/// checked against the registered argument descriptor before decoding.
pub struct Operations<T> {
    contract: Cow<'static, str>,
    handlers: HashMap<Cow<'static, str>, Operation<T>>,
}

impl<T: 'static> Operations<T> {
    pub fn new(contract: &'static str) -> Self {
        Self {
            contract: Cow::Borrowed(contract),
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` as operation `name` taking `A` and returning `R`.
    pub fn register<A, R, F>(mut self, name: &'static str, handler: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&T, &CallContext, A) -> Result<R> + Send + Sync + 'static,
    {
        let signature = Signature {
            argument: type_name::<A>().to_string(),
            output: type_name::<R>().to_string(),
        };
        let boxed: Box<HandlerFn<T>> = Box::new(move |target: &T, ctx: &CallContext, call: &RemoteCall| {
            let args: A = call.decode_args()?;
            let output = handler(target, ctx, args)?;
            Ok(bincode::serialize(&output)?)
        });
        self.handlers.insert(
            Cow::Borrowed(name),
            Operation {
                signature,
                handler: boxed,
            },
        );
        self
    }

    pub fn contract(&self) -> Contract {
        Contract {
            name: self.contract.clone(),
            operations: self
                .handlers
                .iter()
                .map(|(name, op)| (name.to_string(), op.signature.clone()))
                .collect(),
        }
    }

    pub fn dispatch(&self, target: &T, ctx: &CallContext, call: &RemoteCall) -> Result<Vec<u8>> {
        let operation = self.handlers.get(call.operation.as_str()).ok_or_else(|| {
            ProtocolError::UnknownOperation {
                endpoint: call.endpoint.clone(),
                operation: call.operation.clone(),
            }
        })?;

        if call.arg_types.len() != 1 || call.arg_types[0] != operation.signature.argument {
            return Err(ProtocolError::ArgumentMismatch {
                operation: call.operation.clone(),
                expected: vec![operation.signature.argument.clone()],
                actual: call.arg_types.clone(),
            });
        }

        (operation.handler)(target, ctx, call)
    }
}

/// A type that can be registered as an endpoint implementor.
pub trait Capability: Send + Sync + Sized + 'static {
    fn operations() -> Operations<Self>;
}

/// Type-erased implementor held by an endpoint
pub trait Implementor: Send + Sync {
    fn contract(&self) -> &Contract;

    fn dispatch(&self, ctx: &CallContext, call: &RemoteCall) -> Result<Vec<u8>>;

    /// Pointer identity of the registered object
    fn identity(&self) -> usize;
}

/// Binds a collaborator's object to its operation table.
pub struct Bound<T: Capability> {
    target: Arc<T>,
    operations: Operations<T>,
    contract: Contract,
}

impl<T: Capability> Bound<T> {
    pub fn new(target: Arc<T>) -> Self {
        let operations = T::operations();
        let contract = operations.contract();
        Self {
            target,
            operations,
            contract,
        }
    }
}

/// Identity used to match an implementor on removal.
pub fn identity_of<T>(target: &Arc<T>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl<T: Capability> Implementor for Bound<T> {
    fn contract(&self) -> &Contract {
        &self.contract
    }

    fn dispatch(&self, ctx: &CallContext, call: &RemoteCall) -> Result<Vec<u8>> {
        self.operations.dispatch(&self.target, ctx, call)
    }

    fn identity(&self) -> usize {
        identity_of(&self.target)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        value: AtomicU32,
    }

    impl Capability for Counter {
        fn operations() -> Operations<Self> {
            Operations::new("counter")
                .register("add", |c: &Counter, _ctx: &CallContext, n: u32| {
                    Ok(c.value.fetch_add(n, Ordering::SeqCst) + n)
                })
                .register("get", |c: &Counter, _ctx: &CallContext, _: ()| {
                    Ok(c.value.load(Ordering::SeqCst))
                })
        }
    }

    fn ctx() -> CallContext {
        CallContext {
            sender: Node::new("local", "127.0.0.1:1".parse().unwrap()),
        }
    }

    #[test]
    fn test_dispatch_typed_operation() {
        let bound = Bound::new(Arc::new(Counter {
            value: AtomicU32::new(1),
        }));
        let call = RemoteCall::new("c", "add", &4u32).unwrap();
        let out = bound.dispatch(&ctx(), &call).unwrap();
        assert_eq!(bincode::deserialize::<u32>(&out).unwrap(), 5);
    }

    #[test]
    fn test_unknown_operation() {
        let bound = Bound::new(Arc::new(Counter {
            value: AtomicU32::new(0),
        }));
        let call = RemoteCall::new("c", "reset", &()).unwrap();
        assert!(matches!(
            bound.dispatch(&ctx(), &call),
            Err(ProtocolError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_argument_mismatch() {
        let bound = Bound::new(Arc::new(Counter {
            value: AtomicU32::new(0),
        }));
        let call = RemoteCall::new("c", "add", &"four".to_string()).unwrap();
        assert!(matches!(
            bound.dispatch(&ctx(), &call),
            Err(ProtocolError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn test_contract_equality() {
        let a = Counter::operations().contract();
        let b = Counter::operations().contract();
        assert_eq!(a.mismatch(&b), None);
        assert_eq!(a.operations.len(), 2);
    }
}
