//! Batch Request Router
//!
//! Outbound request queue owned by one inbound connection of a routing
//! intermediary. Requests are collected and handed to a single flush worker;
//! oneway, datagram and batch requests carrying an override key replace the
//! unflushed request with the same mode and key in place, so only the latest
//! one is forwarded.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId};
use crate::executor::{Completed, Invocation, InvocationExecutor};
use crate::reference::{InvocationMode, Reference};
use crate::{RemotingError, Result};

/// One request waiting to be forwarded
pub struct RoutedRequest {
    reference: Reference,
    operation: String,
    body: Bytes,
    override_key: Option<String>,
    reply: Option<oneshot::Sender<Result<Completed>>>,
}

impl RoutedRequest {
    /// `body` is the already encoded request; the mode comes from `reference`
    pub fn new(reference: Reference, operation: impl Into<String>, body: Bytes) -> Self {
        Self {
            reference,
            operation: operation.into(),
            body,
            override_key: None,
            reply: None,
        }
    }

    pub fn with_override(mut self, key: impl Into<String>) -> Self {
        self.override_key = Some(key.into());
        self
    }

    /// Attach a channel that receives the outcome of a twoway request
    pub fn with_reply_channel(mut self) -> (Self, oneshot::Receiver<Result<Completed>>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }

    pub fn mode(&self) -> InvocationMode {
        self.reference.mode()
    }

    pub fn override_key(&self) -> Option<&str> {
        self.override_key.as_deref()
    }

    fn collapses_with(&self, other: &RoutedRequest) -> bool {
        self.mode() != InvocationMode::Twoway
            && self.mode() == other.mode()
            && self.override_key.is_some()
            && self.override_key == other.override_key
    }

    fn into_invocation(self) -> (Invocation, Option<oneshot::Sender<Result<Completed>>>) {
        (Invocation::new(self.reference, self.operation, self.body), self.reply)
    }
}

/// Result of a submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Replaced an unflushed request with the same override key
    Replaced,
    /// Unbuffered router; dispatched before returning
    Executed,
}

/// Router counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub queued: usize,
    pub submitted: u64,
    pub replaced: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub flushes: u64,
}

#[derive(Default)]
struct RouterQueue {
    entries: Vec<RoutedRequest>,
    /// A wake-up is pending for the worker
    scheduled: bool,
    destroyed: bool,
}

struct RouterShared {
    owner: ConnectionId,
    executor: Arc<InvocationExecutor>,
    queue: Mutex<RouterQueue>,
    wake: Notify,
    sleep_time: Option<Duration>,
    cancel: CancellationToken,
    submitted: AtomicU64,
    replaced: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
}

pub struct BatchRequestRouter {
    shared: Arc<RouterShared>,
    buffered: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchRequestRouter {
    /// Create a router for requests arriving on `owner` and start its worker
    pub fn new(
        owner: &Connection,
        executor: Arc<InvocationExecutor>,
        buffered: bool,
        sleep_time: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(RouterShared {
            owner: owner.id(),
            executor,
            queue: Mutex::new(RouterQueue::default()),
            wake: Notify::new(),
            sleep_time,
            cancel,
            submitted: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        });

        let worker = buffered.then(|| tokio::spawn(shared.clone().run()));
        debug!(owner = %shared.owner, buffered, "Batch request router created");

        Self {
            shared,
            buffered,
            worker: Mutex::new(worker),
        }
    }

    pub fn owner(&self) -> ConnectionId {
        self.shared.owner
    }

    pub async fn submit(&self, entry: RoutedRequest) -> Result<Submitted> {
        if !self.buffered {
            if self.shared.queue.lock().destroyed {
                return Err(RemotingError::QueueDestroyed);
            }
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            self.shared.dispatch(vec![entry]).await;
            return Ok(Submitted::Executed);
        }

        let mut queue = self.shared.queue.lock();
        if queue.destroyed {
            return Err(RemotingError::QueueDestroyed);
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = queue.entries.iter_mut().find(|queued| entry.collapses_with(queued)) {
            debug!(owner = %self.shared.owner, key = ?entry.override_key, "Replacing queued request");
            *slot = entry;
            self.shared.replaced.fetch_add(1, Ordering::Relaxed);
            return Ok(Submitted::Replaced);
        }

        let wakes = !entry.mode().is_batch() && !queue.scheduled;
        queue.entries.push(entry);
        if wakes {
            queue.scheduled = true;
            self.shared.wake.notify_one();
        }
        Ok(Submitted::Queued)
    }

    /// Wake the worker so queued batch requests go out now
    pub fn flush(&self) {
        let mut queue = self.shared.queue.lock();
        if !queue.scheduled && !queue.entries.is_empty() {
            queue.scheduled = true;
            self.shared.wake.notify_one();
        }
    }

    /// Stop accepting requests; returns once the worker has drained the queue
    pub async fn destroy(&self) {
        self.shared.shut_down();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(owner = %self.shared.owner, "Router worker ended abnormally: {}", e);
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            queued: self.shared.queue.lock().entries.len(),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            replaced: self.shared.replaced.load(Ordering::Relaxed),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            flushes: self.shared.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BatchRequestRouter {
    fn drop(&mut self) {
        self.shared.shut_down();
    }
}

impl RouterShared {
    fn shut_down(&self) {
        let mut queue = self.queue.lock();
        if !queue.destroyed {
            queue.destroyed = true;
            self.wake.notify_one();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.cancel.cancelled() => self.shut_down(),
            }

            let (entries, destroyed) = {
                let mut queue = self.queue.lock();
                queue.scheduled = false;
                (std::mem::take(&mut queue.entries), queue.destroyed)
            };

            if !entries.is_empty() {
                self.dispatch(entries).await;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                if let Some(sleep_time) = self.sleep_time.filter(|_| !destroyed) {
                    tokio::time::sleep(sleep_time).await;
                }
            }

            if destroyed {
                break;
            }
        }
        debug!(owner = %self.owner, "Router worker stopped");
    }

    /// Forward entries in queue order; batch requests are flushed once per connection at the end
    async fn dispatch(&self, entries: Vec<RoutedRequest>) {
        let mut seen = BTreeSet::new();
        let mut batch_connections = Vec::new();

        for entry in entries {
            self.dispatched.fetch_add(1, Ordering::Relaxed);
            match entry.mode() {
                InvocationMode::Batch => {
                    let queued = match self.executor.connect(&entry.reference).await {
                        Ok(connection) => connection
                            .queue_batch(entry.body)
                            .map(|_| connection)
                            .map_err(RemotingError::from),
                        Err(e) => Err(e),
                    };
                    match queued {
                        Ok(connection) => {
                            if seen.insert(connection.id()) {
                                batch_connections.push(connection);
                            }
                        }
                        Err(error) => {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(owner = %self.owner, operation = %entry.operation, %error, "Failed to queue batch request");
                        }
                    }
                }
                InvocationMode::Twoway => {
                    let (invocation, reply) = entry.into_invocation();
                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        let result = executor.invoke(&invocation).await;
                        match reply {
                            Some(reply) => {
                                let _ = reply.send(result);
                            }
                            None => {
                                if let Err(error) = result {
                                    warn!(operation = %invocation.operation, %error, "Routed twoway request failed");
                                }
                            }
                        }
                    });
                }
                InvocationMode::Oneway | InvocationMode::Datagram => {
                    let (invocation, _) = entry.into_invocation();
                    if let Err(error) = self.executor.invoke(&invocation).await {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(owner = %self.owner, operation = %invocation.operation, %error, "Failed to forward request");
                    }
                }
            }
        }

        for connection in batch_connections {
            if let Err(e) = connection.flush_batch().await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(owner = %self.owner, connection = %connection.id(), error = %e.error, "Batch flush failed");
            }
        }
    }
}
