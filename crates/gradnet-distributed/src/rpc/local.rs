//! Local Agent - In-Process RPC Between Simulated Workers
//!
//! A world of agents sharing one process. Every message is encoded to bytes
//! and decoded on the receiving side, runs on the receiver's request
//! threads, and is subject to the caller's deadline, so the autograd layer
//! sees the same behaviour it would over a network.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use gradnet_autograd::FutureCell;
use gradnet_core::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::config::DistAutogradConfig;
use crate::rpc::{DeviceMap, Message, RequestHandler, RpcAgent, RpcFuture};
use crate::WorkerId;

type Job = Box<dyn FnOnce() + Send>;

// =============================================================================
// Inbox
// =============================================================================

struct InboxState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// Requests waiting to be served by one worker.
struct Inbox {
    state: Mutex<InboxState>,
    available: Condvar,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
}

impl Inbox {
    fn new() -> Self {
        Self {
            state: Mutex::new(InboxState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            handler: RwLock::new(None),
        }
    }

    /// Queues `job`; gives it back if the worker has shut down.
    fn push(&self, job: Job) -> std::result::Result<(), Job> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(job);
        }
        state.jobs.push_back(job);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks for the next job; `None` once shut down and drained.
    fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
        self.handler.write().take();
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().clone()
    }
}

fn inbox_main(inbox: &Inbox) {
    while let Some(job) = inbox.pop() {
        job();
    }
}

// =============================================================================
// Watchdog
// =============================================================================

struct Pending {
    future: RpcFuture,
    worker_id: WorkerId,
    timeout: Duration,
}

struct WatchdogState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, Pending>,
    next_ticket: u64,
    shutdown: bool,
}

/// Fails futures whose reply did not arrive before their deadline.
struct Watchdog {
    state: Mutex<WatchdogState>,
    wake: Condvar,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            state: Mutex::new(WatchdogState {
                deadlines: BinaryHeap::new(),
                pending: HashMap::new(),
                next_ticket: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    fn arm(&self, future: &RpcFuture, worker_id: WorkerId, timeout: Duration) -> u64 {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.deadlines.push(Reverse((Instant::now() + timeout, ticket)));
        state.pending.insert(
            ticket,
            Pending {
                future: Arc::clone(future),
                worker_id,
                timeout,
            },
        );
        self.wake.notify_one();
        ticket
    }

    fn disarm(&self, ticket: u64) {
        self.state.lock().pending.remove(&ticket);
    }

    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.deadlines.peek().map(|Reverse(entry)| *entry) {
                None => self.wake.wait(&mut state),
                Some((when, ticket)) if when <= Instant::now() => {
                    state.deadlines.pop();
                    if let Some(pending) = state.pending.remove(&ticket) {
                        // Failing the future runs its callbacks, which may send.
                        MutexGuard::unlocked(&mut state, || expire(pending));
                    }
                }
                Some((when, _)) => {
                    self.wake.wait_until(&mut state, when);
                }
            }
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }
}

fn expire(pending: Pending) {
    let timeout_ms = u64::try_from(pending.timeout.as_millis()).unwrap_or(u64::MAX);
    tracing::warn!(worker_id = pending.worker_id, timeout_ms, "rpc timed out");
    pending.future.set_error(Error::Timeout {
        worker_id: pending.worker_id,
        timeout_ms,
    });
}

// =============================================================================
// Local World
// =============================================================================

struct LocalWorld {
    inboxes: Vec<Arc<Inbox>>,
    watchdog: Arc<Watchdog>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalWorld {
    fn shutdown(&self) {
        for inbox in &self.inboxes {
            inbox.shutdown();
        }
        self.watchdog.shutdown();
    }
}

impl Drop for LocalWorld {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Local RPC Agent
// =============================================================================

/// RPC agent for one worker of an in-process world.
pub struct LocalRpcAgent {
    worker_id: WorkerId,
    world: Arc<LocalWorld>,
}

impl LocalRpcAgent {
    /// Creates `world_size` connected agents, worker ids `0..world_size`.
    ///
    /// Each worker serves requests on `config.rpc_threads` threads.
    pub fn create_world(world_size: usize, config: &DistAutogradConfig) -> Result<Vec<Arc<Self>>> {
        config.validate()?;
        if world_size == 0 || world_size > usize::from(WorkerId::MAX) + 1 {
            return Err(Error::invalid_state(format!(
                "world size must be between 1 and {}, got {world_size}",
                usize::from(WorkerId::MAX) + 1
            )));
        }

        let inboxes: Vec<Arc<Inbox>> = (0..world_size).map(|_| Arc::new(Inbox::new())).collect();
        let watchdog = Arc::new(Watchdog::new());
        let mut threads = Vec::with_capacity(world_size * config.rpc_threads + 1);

        let spawned = Arc::clone(&watchdog);
        threads.push(spawn("gradnet-rpc-watchdog".to_string(), move || spawned.run())?);
        for (worker, inbox) in inboxes.iter().enumerate() {
            for i in 0..config.rpc_threads {
                let inbox = Arc::clone(inbox);
                threads.push(spawn(format!("gradnet-rpc-{worker}-{i}"), move || {
                    inbox_main(&inbox);
                })?);
            }
        }

        let world = Arc::new(LocalWorld {
            inboxes,
            watchdog,
            threads: Mutex::new(threads),
        });
        tracing::debug!(world_size, rpc_threads = config.rpc_threads, "created local rpc world");
        Ok((0..world_size)
            .map(|worker| {
                Arc::new(Self {
                    worker_id: worker as WorkerId,
                    world: Arc::clone(&world),
                })
            })
            .collect())
    }

    /// Installs the handler serving requests addressed to this worker.
    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.inbox().handler.write() = Some(handler);
    }

    /// Stops every worker of the world and joins their threads.
    ///
    /// Queued requests are still served; later sends fail.
    pub fn shutdown(&self) {
        self.world.shutdown();
        let current: ThreadId = thread::current().id();
        let threads = std::mem::take(&mut *self.world.threads.lock());
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!(worker_id = self.worker_id, "rpc thread panicked");
            }
        }
    }

    fn inbox(&self) -> &Arc<Inbox> {
        &self.world.inboxes[usize::from(self.worker_id)]
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| Error::invalid_state(format!("failed to spawn rpc thread: {e}")))
}

impl RpcAgent for LocalRpcAgent {
    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn world_size(&self) -> usize {
        self.world.inboxes.len()
    }

    fn send(
        &self,
        to: WorkerId,
        message: Message,
        timeout: Option<Duration>,
        device_map: &DeviceMap,
    ) -> RpcFuture {
        let future: RpcFuture = Arc::new(FutureCell::new());
        let Some(target) = self.world.inboxes.get(usize::from(to)).cloned() else {
            future.set_error(Error::remote(to, format!("unknown destination worker {to}")));
            return future;
        };
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                future.set_error(e);
                return future;
            }
        };
        tracing::trace!(
            from = self.worker_id,
            to,
            message = %message.message_type(),
            bytes = bytes.len(),
            "sending rpc"
        );

        let ticket = timeout.map(|t| self.world.watchdog.arm(&future, to, t));
        let from = self.worker_id;
        let device_map = device_map.clone();
        let watchdog = Arc::clone(&self.world.watchdog);
        let reply = Arc::clone(&future);
        let inbox = Arc::clone(&target);

        let job: Job = Box::new(move || {
            let finish = move |outcome: Result<Message>| {
                if let Some(ticket) = ticket {
                    watchdog.disarm(ticket);
                }
                reply.complete(outcome);
            };
            let request = match Message::from_bytes(&bytes) {
                Ok(request) => request.map_devices(&device_map),
                Err(e) => return finish(Err(e)),
            };
            let Some(handler) = inbox.handler() else {
                return finish(Err(Error::remote(to, "no request handler registered")));
            };
            handler.handle(from, request).then(move |outcome| {
                let outcome = outcome
                    .clone()
                    .and_then(|response| Message::from_bytes(&response.to_bytes()?))
                    .and_then(|response| response.into_result(to))
                    .map_err(|e| match e {
                        Error::Remote { .. } => e,
                        other => Error::remote(to, other.to_string()),
                    });
                finish(outcome);
            });
        });

        if target.push(job).is_err() {
            if let Some(ticket) = ticket {
                self.world.watchdog.disarm(ticket);
            }
            future.set_error(Error::remote(to, "worker has shut down"));
        }
        future
    }
}

impl std::fmt::Debug for LocalRpcAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRpcAgent")
            .field("worker_id", &self.worker_id)
            .field("world_size", &self.world.inboxes.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
