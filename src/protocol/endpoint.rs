//! Endpoints and call ordering.
//!
//! Every dispatch request takes a [`Ticket`] from its endpoint at the moment the
//! request is made. Multi-threaded endpoints run a redeemed ticket's job right
//! away. Single-threaded endpoints hand the job to a sequencer that runs jobs in
//! strict ticket order with at most one runner at a time: whichever thread finds
//! the next ticket ready drains every consecutive ready job, and threads whose
//! ticket is not yet due park the job and return instead of waiting.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{CallContext, Contract, Implementor};
use crate::protocol::envelope::RemoteCall;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Sequencer {
    next_runnable: u64,
    parked: BTreeMap<u64, Job>,
    draining: bool,
}

/// Named registry slot holding the local implementors of one contract
pub struct Endpoint {
    name: String,
    contract: Contract,
    single_threaded: bool,
    implementors: Mutex<Vec<Arc<dyn Implementor>>>,
    next_ticket: AtomicU64,
    sequencer: Mutex<Sequencer>,
}

impl Endpoint {
    pub fn new(name: &str, contract: Contract, single_threaded: bool) -> Self {
        Self {
            name: name.to_string(),
            contract,
            single_threaded,
            implementors: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(0),
            sequencer: Mutex::new(Sequencer::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub fn implementor_count(&self) -> usize {
        self.implementors.lock().len()
    }

    /// Add an implementor. Returns `false` if the same object was already present.
    pub(crate) fn add(&self, implementor: Arc<dyn Implementor>) -> bool {
        let mut implementors = self.implementors.lock();
        let identity = implementor.identity();
        if implementors.iter().any(|i| i.identity() == identity) {
            return false;
        }
        implementors.push(implementor);
        true
    }

    /// Remove by identity. Returns the number of implementors left, or `None`
    /// if the object was not registered.
    pub(crate) fn remove(&self, identity: usize) -> Option<usize> {
        let mut implementors = self.implementors.lock();
        let index = implementors.iter().position(|i| i.identity() == identity)?;
        implementors.remove(index);
        Some(implementors.len())
    }

    /// Reserve the next place in this endpoint's call order.
    pub fn take_ticket(self: &Arc<Self>) -> Ticket {
        let number = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        trace!(endpoint = %self.name, ticket = number, "Ticket issued");
        Ticket {
            endpoint: Arc::clone(self),
            number,
            redeemed: false,
        }
    }

    /// Run `call` against every local implementor.
    ///
    /// A panicking implementor yields an `InvocationFailed` result for that
    /// implementor only.
    pub fn invoke_local(&self, ctx: &CallContext, call: &RemoteCall) -> Vec<Result<Vec<u8>>> {
        let implementors: Vec<_> = self.implementors.lock().clone();
        implementors
            .iter()
            .map(|implementor| {
                catch_unwind(AssertUnwindSafe(|| implementor.dispatch(ctx, call))).unwrap_or_else(
                    |_| {
                        error!(endpoint = %self.name, operation = %call.operation, "Implementor panicked");
                        Err(ProtocolError::InvocationFailed(
                            constants::ERR_IMPLEMENTOR_PANICKED.to_string(),
                        ))
                    },
                )
            })
            .collect()
    }

    fn submit(&self, ticket: u64, job: Job) {
        let mut seq = self.sequencer.lock();
        seq.parked.insert(ticket, job);
        if seq.draining {
            return;
        }
        seq.draining = true;

        loop {
            let next = seq.next_runnable;
            let Some(job) = seq.parked.remove(&next) else {
                seq.draining = false;
                return;
            };
            drop(seq);

            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(endpoint = %self.name, ticket = next, "Sequenced job panicked");
            }

            seq = self.sequencer.lock();
            seq.next_runnable += 1;
        }
    }
}

/// A reserved place in an endpoint's call order.
///
/// Dropping a ticket without redeeming it releases its place, so later tickets
/// are never held up by a call that was abandoned.
pub struct Ticket {
    endpoint: Arc<Endpoint>,
    number: u64,
    redeemed: bool,
}

impl Ticket {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Run `job` in this ticket's turn. May return before the job has run.
    pub fn run<F>(mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.redeemed = true;
        if self.endpoint.single_threaded {
            self.endpoint.submit(self.number, Box::new(job));
        } else {
            job();
        }
    }

    /// Run `job` in this ticket's turn and wait for its output.
    ///
    /// Blocks the calling thread; not for use inside an async task.
    pub fn call<F, R>(self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if !self.endpoint.single_threaded {
            let mut ticket = self;
            ticket.redeemed = true;
            return Ok(job());
        }

        let (tx, rx) = oneshot::channel();
        self.run(move || {
            let _ = tx.send(job());
        });
        rx.blocking_recv()
            .map_err(|_| ProtocolError::InvocationFailed(constants::ERR_REPLY_DROPPED.to_string()))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.redeemed && self.endpoint.single_threaded {
            trace!(endpoint = %self.endpoint.name, ticket = self.number, "Ticket skipped");
            self.endpoint.submit(self.number, Box::new(|| {}));
        }
    }
}
