//! Single writer task for every channel of a socket.
//!
//! Enqueuers append frames to a per-channel queue under that queue's lock. The
//! first frame of an idle queue signals interest to the writer task, which then
//! keeps exactly one frame of that channel in flight, pops it once fully
//! flushed, and starts the next. A drained queue parks its channel until the
//! next interest signal.
//!
//! Shutdown refuses new frames and keeps flushing the queued ones for at most
//! the given grace period.

use crate::core::frame::OutboundFrame;
use crate::error::{ProtocolError, Result};
use crate::transport::ChannelId;
use crate::utils::metrics::global_metrics;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Called once per channel whose sink failed
pub(crate) type ErrorCallback = Box<dyn Fn(ChannelId, ProtocolError) + Send + Sync>;

#[derive(Default)]
struct ChannelQueue {
    frames: VecDeque<OutboundFrame>,
    interested: bool,
    closing: bool,
}

enum Command {
    Register(ChannelId, BoxedWrite),
    Interest(ChannelId),
    Close(ChannelId),
    Shutdown(Duration),
}

type Queues = Arc<Mutex<HashMap<ChannelId, Arc<Mutex<ChannelQueue>>>>>;

/// Enqueue side of the writer; cheap to clone.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    commands: mpsc::UnboundedSender<Command>,
    queues: Queues,
}

impl WriterHandle {
    pub(crate) fn register(&self, channel: ChannelId, sink: BoxedWrite) {
        self.queues
            .lock()
            .insert(channel, Arc::new(Mutex::new(ChannelQueue::default())));
        let _ = self.commands.send(Command::Register(channel, sink));
    }

    /// Append a frame to the channel's queue, preserving enqueue order.
    pub(crate) fn enqueue(&self, channel: ChannelId, frame: OutboundFrame) -> Result<()> {
        let queue = self
            .queues
            .lock()
            .get(&channel)
            .cloned()
            .ok_or(ProtocolError::UnknownChannel(channel))?;

        let mut queue = queue.lock();
        if queue.closing {
            return Err(ProtocolError::ConnectionClosed);
        }
        queue.frames.push_back(frame);
        global_metrics().frame_sent();

        if !queue.interested {
            queue.interested = true;
            self.commands
                .send(Command::Interest(channel))
                .map_err(|_| ProtocolError::Shutdown)?;
        }
        Ok(())
    }

    /// Close the write half once every queued frame has been flushed.
    pub(crate) fn close(&self, channel: ChannelId) {
        let queue = self.queues.lock().get(&channel).cloned();
        if let Some(queue) = queue {
            queue.lock().closing = true;
            let _ = self.commands.send(Command::Close(channel));
        }
    }

    /// Refuse new frames and stop once queued frames are flushed or `grace` ends.
    pub(crate) fn shutdown(&self, grace: Duration) {
        for queue in self.queues.lock().values() {
            queue.lock().closing = true;
        }
        let _ = self.commands.send(Command::Shutdown(grace));
    }
}

type Flush = BoxFuture<'static, (ChannelId, BoxedWrite, Result<usize>)>;

/// Start the writer task.
pub(crate) fn spawn_writer(on_error: ErrorCallback) -> (WriterHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::unbounded_channel();
    let queues: Queues = Arc::new(Mutex::new(HashMap::new()));
    let handle = WriterHandle {
        commands,
        queues: Arc::clone(&queues),
    };
    let task = tokio::spawn(run(rx, queues, on_error));
    (handle, task)
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, queues: Queues, on_error: ErrorCallback) {
    let mut idle: HashMap<ChannelId, BoxedWrite> = HashMap::new();
    let mut in_flight: FuturesUnordered<Flush> = FuturesUnordered::new();

    let grace = loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => break Duration::ZERO,
                Some(Command::Shutdown(grace)) => break grace,
                Some(Command::Register(channel, sink)) => {
                    idle.insert(channel, sink);
                }
                Some(Command::Interest(channel)) => {
                    // A sink that is not idle is in flight and picks up the
                    // new frame when its current write completes.
                    if let Some(sink) = idle.remove(&channel) {
                        in_flight.push(flush_front(channel, sink, &queues));
                    }
                }
                Some(Command::Close(channel)) => {
                    if let Some(sink) = idle.remove(&channel) {
                        in_flight.push(flush_front(channel, sink, &queues));
                    }
                }
            },
            Some((channel, sink, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                match settle(channel, outcome, &queues, &on_error) {
                    Some(Next::Write) => in_flight.push(flush_front(channel, sink, &queues)),
                    Some(Next::Park) => {
                        idle.insert(channel, sink);
                    }
                    Some(Next::Close) => {
                        queues.lock().remove(&channel);
                        tokio::spawn(shutdown_sink(channel, sink));
                    }
                    None => {}
                }
            }
        }
    };

    for (channel, sink) in idle.drain() {
        queues.lock().remove(&channel);
        tokio::spawn(shutdown_sink(channel, sink));
    }
    if !in_flight.is_empty() {
        let unflushed = in_flight.len();
        if tokio::time::timeout(grace, drain(&mut in_flight, &queues, &on_error))
            .await
            .is_err()
        {
            debug!(channels = in_flight.len(), "Shutdown grace elapsed, unflushed frames dropped");
        } else {
            trace!(channels = unflushed, "Queues drained before shutdown");
        }
    }

    debug!("Writer stopped");
}

/// Flush what is still in flight, closing each channel once its queue empties.
async fn drain(in_flight: &mut FuturesUnordered<Flush>, queues: &Queues, on_error: &ErrorCallback) {
    while let Some((channel, sink, outcome)) = in_flight.next().await {
        match settle(channel, outcome, queues, on_error) {
            Some(Next::Write) => in_flight.push(flush_front(channel, sink, queues)),
            Some(Next::Park | Next::Close) => {
                queues.lock().remove(&channel);
                shutdown_sink(channel, sink).await;
            }
            None => {}
        }
    }
}

/// Account for a finished write. `None` means the channel failed and was reported.
fn settle(
    channel: ChannelId,
    outcome: Result<usize>,
    queues: &Queues,
    on_error: &ErrorCallback,
) -> Option<Next> {
    match outcome {
        Ok(written) => {
            if written > 0 {
                global_metrics().bytes_flushed(written as u64);
            }
            Some(advance(channel, queues, written > 0))
        }
        Err(e) => {
            queues.lock().remove(&channel);
            debug!(channel, error = %e, "Write failed");
            on_error(channel, e);
            None
        }
    }
}

enum Next {
    Write,
    Park,
    Close,
}

/// Pop the flushed frame and decide what the channel does next.
fn advance(channel: ChannelId, queues: &Queues, popped: bool) -> Next {
    let Some(queue) = queues.lock().get(&channel).cloned() else {
        return Next::Close;
    };
    let mut queue = queue.lock();
    if popped {
        queue.frames.pop_front();
    }
    if !queue.frames.is_empty() {
        return Next::Write;
    }
    queue.interested = false;
    if queue.closing {
        Next::Close
    } else {
        trace!(channel, "Queue drained");
        Next::Park
    }
}

fn flush_front(channel: ChannelId, mut sink: BoxedWrite, queues: &Queues) -> Flush {
    let frame = queues
        .lock()
        .get(&channel)
        .and_then(|queue| queue.lock().frames.front().cloned());

    async move {
        let outcome = match frame {
            Some(mut frame) => frame.write_to(&mut sink).await,
            None => Ok(0),
        };
        (channel, sink, outcome)
    }
    .boxed()
}

async fn shutdown_sink(channel: ChannelId, mut sink: BoxedWrite) {
    if let Err(e) = sink.shutdown().await {
        trace!(channel, error = %e, "Write half shutdown failed");
    }
}
