//! Container - Registry of Distributed Autograd Contexts
//!
//! One container per worker owns every live context of that worker in a
//! sharded map, allocates context and autograd message ids that are unique
//! across workers, tracks the calling thread's current context, and tells
//! the other participants to drop their copy when a context is released.
//!
//! Ids carry the worker id in their top 16 bits and a per-worker counter in
//! the remaining 48, so workers never need to coordinate to stay unique.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use gradnet_core::{Error, Result};
use parking_lot::{const_mutex, Mutex, RwLock};

use crate::config::DistAutogradConfig;
use crate::context::DistAutogradContext;
use crate::rpc::{DeviceMap, Message, RpcAgent};
use crate::{ContextId, MessageId, WorkerId};

/// Bits of an id taken by the per-worker counter.
pub const LOCAL_ID_BITS: u32 = 48;

const MAX_LOCAL_IDS: u64 = 1 << LOCAL_ID_BITS;

thread_local! {
    static CURRENT_CONTEXT_ID: Cell<Option<ContextId>> = const { Cell::new(None) };
}

static INSTANCE: Mutex<Option<Arc<DistAutogradContainer>>> = const_mutex(None);

// =============================================================================
// Shards
// =============================================================================

#[repr(align(64))]
#[derive(Default)]
struct ContextShard {
    contexts: Mutex<HashMap<ContextId, Arc<DistAutogradContext>>>,
}

fn mix(id: ContextId) -> u64 {
    let mut x = id as u64;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x
}

// =============================================================================
// DistAutogradContainer
// =============================================================================

/// Per-worker registry of distributed autograd contexts.
pub struct DistAutogradContainer {
    worker_id: WorkerId,
    base_id: i64,
    max_id: i64,
    next_context_id: AtomicI64,
    next_autograd_message_id: AtomicI64,
    shards: Box<[ContextShard]>,
    agent: RwLock<Option<Weak<dyn RpcAgent>>>,
    rpc_timeout: Option<Duration>,
}

impl DistAutogradContainer {
    /// Creates a container for `worker_id`.
    pub fn new(worker_id: WorkerId, config: &DistAutogradConfig) -> Result<Self> {
        config.validate()?;
        let base_id = (u64::from(worker_id) << LOCAL_ID_BITS) as i64;
        let num_shards = config.shard_count();
        Ok(Self {
            worker_id,
            base_id,
            max_id: base_id.wrapping_add((MAX_LOCAL_IDS - 1) as i64),
            next_context_id: AtomicI64::new(base_id),
            next_autograd_message_id: AtomicI64::new(base_id),
            shards: (0..num_shards).map(|_| ContextShard::default()).collect(),
            agent: RwLock::new(None),
            rpc_timeout: config.rpc_timeout(),
        })
    }

    /// Initializes the process-wide container.
    ///
    /// Calling it again with the same worker id returns the existing
    /// container; a different worker id is an error.
    pub fn init(worker_id: WorkerId, config: &DistAutogradConfig) -> Result<Arc<Self>> {
        let mut instance = INSTANCE.lock();
        if let Some(existing) = instance.as_ref() {
            if existing.worker_id != worker_id {
                return Err(Error::invalid_state(format!(
                    "container is already initialized with worker_id {}, cannot initialize \
                     with worker_id {worker_id}",
                    existing.worker_id
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let container = Arc::new(Self::new(worker_id, config)?);
        tracing::info!(
            worker_id,
            num_shards = container.num_shards(),
            "initialized distributed autograd container"
        );
        *instance = Some(Arc::clone(&container));
        Ok(container)
    }

    /// The process-wide container.
    pub fn get_instance() -> Result<Arc<Self>> {
        INSTANCE.lock().clone().ok_or_else(|| {
            Error::invalid_state(
                "distributed autograd container is not initialized; call \
                 DistAutogradContainer::init first",
            )
        })
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Worker this container belongs to.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Largest id this worker may allocate.
    #[must_use]
    pub fn max_id(&self) -> i64 {
        self.max_id
    }

    /// Number of context map shards.
    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Deadline applied to RPCs sent on behalf of contexts.
    #[must_use]
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout
    }

    /// Number of live contexts.
    #[must_use]
    pub fn num_autograd_contexts(&self) -> usize {
        self.shards.iter().map(|s| s.contexts.lock().len()).sum()
    }

    /// Connects the agent used for release broadcasts.
    pub fn set_rpc_agent(&self, agent: &Arc<dyn RpcAgent>) -> Result<()> {
        if agent.worker_id() != self.worker_id {
            return Err(Error::invalid_state(format!(
                "rpc agent of worker {} cannot serve container of worker {}",
                agent.worker_id(),
                self.worker_id
            )));
        }
        *self.agent.write() = Some(Arc::downgrade(agent));
        Ok(())
    }

    /// The connected agent, while it is alive.
    #[must_use]
    pub fn rpc_agent(&self) -> Option<Arc<dyn RpcAgent>> {
        self.agent.read().as_ref().and_then(Weak::upgrade)
    }

    // =========================================================================
    // Id Allocation
    // =========================================================================

    fn allocate(&self, counter: &AtomicI64, what: &str) -> Result<i64> {
        let base = self.base_id;
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                ((id.wrapping_sub(base) as u64) < MAX_LOCAL_IDS).then(|| id.wrapping_add(1))
            })
            .map_err(|_| {
                Error::structural(format!(
                    "exhausted {what} ids of worker {} (max id {})",
                    self.worker_id, self.max_id
                ))
            })
    }

    /// Allocates a fresh autograd message id.
    pub fn new_autograd_message_id(&self) -> Result<MessageId> {
        self.allocate(&self.next_autograd_message_id, "autograd message")
    }

    /// Allocates a fresh context id without registering a context.
    pub fn new_context_id(&self) -> Result<ContextId> {
        self.allocate(&self.next_context_id, "context")
    }

    // =========================================================================
    // Context Lifecycle
    // =========================================================================

    fn shard(&self, context_id: ContextId) -> &ContextShard {
        &self.shards[(mix(context_id) as usize) & (self.shards.len() - 1)]
    }

    /// Creates a context with a fresh id and makes it current on this thread.
    pub fn new_context(&self) -> Result<Arc<DistAutogradContext>> {
        if let Some(current) = self.current_context_id() {
            return Err(Error::invalid_state(format!(
                "already have autograd context {current} for this thread"
            )));
        }
        let context_id = self.new_context_id()?;
        let context = Arc::new(DistAutogradContext::new(context_id));
        self.shard(context_id)
            .contexts
            .lock()
            .insert(context_id, Arc::clone(&context));
        CURRENT_CONTEXT_ID.with(|current| current.set(Some(context_id)));
        tracing::info!(context_id, worker_id = self.worker_id, "created autograd context");
        Ok(context)
    }

    /// Returns context `context_id`, creating it if absent.
    ///
    /// Used for passes started by another worker; the current context of
    /// the calling thread is left alone.
    pub fn get_or_create_context(&self, context_id: ContextId) -> Arc<DistAutogradContext> {
        let mut contexts = self.shard(context_id).contexts.lock();
        Arc::clone(contexts.entry(context_id).or_insert_with(|| {
            tracing::info!(context_id, worker_id = self.worker_id, "joined autograd context");
            Arc::new(DistAutogradContext::new(context_id))
        }))
    }

    /// Returns context `context_id`.
    pub fn retrieve_context(&self, context_id: ContextId) -> Result<Arc<DistAutogradContext>> {
        self.shard(context_id)
            .contexts
            .lock()
            .get(&context_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_state(format!("could not find autograd context with id {context_id}"))
            })
    }

    /// Whether context `context_id` is live.
    #[must_use]
    pub fn is_valid_context(&self, context_id: ContextId) -> bool {
        self.shard(context_id)
            .contexts
            .lock()
            .contains_key(&context_id)
    }

    /// Releases context `context_id` and asks the other participants to
    /// release theirs.
    pub fn release_context(&self, context_id: ContextId) -> Result<()> {
        let context = self
            .shard(context_id)
            .contexts
            .lock()
            .remove(&context_id)
            .ok_or_else(|| {
                Error::invalid_state(format!("could not find autograd context with id {context_id}"))
            })?;
        self.finish_release(&context);
        Ok(())
    }

    /// Like [`Self::release_context`], but a missing context is not an error.
    pub fn release_context_if_present(&self, context_id: ContextId) {
        let removed = self.shard(context_id).contexts.lock().remove(&context_id);
        match removed {
            Some(context) => self.finish_release(&context),
            None => {
                if self.current_context_id() == Some(context_id) {
                    self.clear_current_context();
                }
            }
        }
    }

    /// Runs with the shard lock already dropped.
    fn finish_release(&self, context: &DistAutogradContext) {
        let context_id = context.context_id();
        if self.current_context_id() == Some(context_id) {
            self.clear_current_context();
        }
        context.reset_graph_task();
        tracing::info!(context_id, worker_id = self.worker_id, "released autograd context");
        self.send_release_context_rpc(context);
    }

    fn send_release_context_rpc(&self, context: &DistAutogradContext) {
        let context_id = context.context_id();
        let peers: Vec<WorkerId> = context
            .known_worker_ids()
            .into_iter()
            .filter(|&w| w != self.worker_id)
            .collect();
        if peers.is_empty() {
            return;
        }
        let Some(agent) = self.rpc_agent() else {
            tracing::warn!(context_id, "no rpc agent; peers keep their copy of the context");
            return;
        };
        for worker_id in peers {
            let future = agent.send(
                worker_id,
                Message::CleanupAutogradContextReq { context_id },
                self.rpc_timeout,
                &DeviceMap::new(),
            );
            future.then(move |outcome| {
                if let Err(e) = outcome {
                    tracing::warn!(
                        context_id,
                        worker_id,
                        error = %e,
                        "failed to release autograd context on peer"
                    );
                }
            });
        }
    }

    /// Creates a context that is released when the returned scope drops.
    pub fn scope(&self) -> Result<ContextScope<'_>> {
        let context = self.new_context()?;
        Ok(ContextScope {
            container: self,
            context,
        })
    }

    // =========================================================================
    // Current Context
    // =========================================================================

    /// The current context of this thread.
    pub fn current_context(&self) -> Result<Arc<DistAutogradContext>> {
        let context_id = self.current_context_id().ok_or_else(|| {
            Error::invalid_state(
                "current thread doesn't have a valid autograd context; create one with \
                 DistAutogradContainer::new_context or DistAutogradContainer::scope",
            )
        })?;
        self.retrieve_context(context_id)
    }

    /// Whether this thread has a current context.
    #[must_use]
    pub fn has_valid_context(&self) -> bool {
        self.current_context_id().is_some()
    }

    /// Id of this thread's current context.
    #[must_use]
    pub fn current_context_id(&self) -> Option<ContextId> {
        CURRENT_CONTEXT_ID.with(Cell::get)
    }

    /// Makes `context_id` current on this thread.
    ///
    /// Fails if a different context is already current.
    pub fn set_current_context_id(&self, context_id: ContextId) -> Result<()> {
        match self.current_context_id() {
            Some(current) if current != context_id => Err(Error::invalid_state(format!(
                "already have autograd context {current} for this thread, cannot set {context_id}"
            ))),
            _ => {
                CURRENT_CONTEXT_ID.with(|current| current.set(Some(context_id)));
                Ok(())
            }
        }
    }

    /// Makes `context_id` current on this thread, replacing any current one.
    ///
    /// Callers must state at the call site why replacing is safe there.
    pub fn force_current_context_id(&self, context_id: ContextId) {
        CURRENT_CONTEXT_ID.with(|current| current.set(Some(context_id)));
    }

    /// Leaves this thread without a current context.
    pub fn clear_current_context(&self) {
        CURRENT_CONTEXT_ID.with(|current| current.set(None));
    }
}

impl std::fmt::Debug for DistAutogradContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistAutogradContainer")
            .field("worker_id", &self.worker_id)
            .field("num_shards", &self.shards.len())
            .field("contexts", &self.num_autograd_contexts())
            .finish()
    }
}

// =============================================================================
// Context Scope
// =============================================================================

/// A context current on this thread for the lifetime of the scope.
///
/// Dropping the scope releases the context, if still present, and clears
/// the thread's current context on every exit path.
pub struct ContextScope<'a> {
    container: &'a DistAutogradContainer,
    context: Arc<DistAutogradContext>,
}

impl ContextScope<'_> {
    /// The scoped context.
    #[must_use]
    pub fn context(&self) -> &Arc<DistAutogradContext> {
        &self.context
    }

    /// Id of the scoped context.
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context.context_id()
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.container
            .release_context_if_present(self.context.context_id());
        self.container.clear_current_context();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{LocalRpcAgent, RequestHandler, RpcFuture};
    use gradnet_autograd::FutureCell;
    use gradnet_core::ErrorKind;
    use std::collections::HashSet;
    use std::thread;

    fn container(worker_id: WorkerId) -> DistAutogradContainer {
        let config = DistAutogradConfig {
            num_shards: Some(4),
            ..DistAutogradConfig::default()
        };
        DistAutogradContainer::new(worker_id, &config).unwrap()
    }

    #[test]
    fn test_ids_carry_worker_id() {
        let c0 = container(0);
        let c1 = container(1);
        let a = c0.new_context().unwrap().context_id();
        c0.clear_current_context();
        let b = c1.new_context().unwrap().context_id();
        c1.clear_current_context();

        assert_eq!(a, 0);
        assert_eq!(b, 1 << 48);
        assert_eq!(b >> LOCAL_ID_BITS, 1);
        assert_eq!(c1.max_id(), (1 << 48) + (1 << 48) - 1);

        let m0 = c0.new_autograd_message_id().unwrap();
        let m1 = c0.new_autograd_message_id().unwrap();
        assert_eq!(m1, m0 + 1);
        assert_eq!(c1.new_autograd_message_id().unwrap(), 1 << 48);
    }

    #[test]
    fn test_top_worker_ids_stay_unique() {
        let high = container(WorkerId::MAX);
        let below = container(WorkerId::MAX - 1);
        let a = high.new_autograd_message_id().unwrap();
        let b = below.new_autograd_message_id().unwrap();
        assert_ne!(a, b);
        assert_eq!(high.max_id(), -1);
    }

    #[test]
    fn test_context_id_without_context() {
        let c = container(3);
        let first = c.new_context_id().unwrap();
        let second = c.new_context_id().unwrap();
        assert_eq!(first >> LOCAL_ID_BITS, 3);
        assert_eq!(second, first + 1);
        assert!(!c.is_valid_context(first));
        assert!(!c.has_valid_context());

        // Contexts draw from the same counter.
        let ctx = c.new_context().unwrap();
        assert_eq!(ctx.context_id(), second + 1);
        c.clear_current_context();
    }

    #[test]
    fn test_id_exhaustion() {
        let c = container(2);
        c.next_autograd_message_id.store(c.max_id(), Ordering::Relaxed);
        assert_eq!(c.new_autograd_message_id().unwrap(), c.max_id());
        let err = c.new_autograd_message_id().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(c.new_autograd_message_id().is_err());
    }

    #[test]
    fn test_context_lifecycle() {
        let c = container(0);
        let ctx = c.new_context().unwrap();
        let id = ctx.context_id();
        assert!(c.has_valid_context());
        assert_eq!(c.current_context().unwrap().context_id(), id);
        assert!(c.is_valid_context(id));
        assert!(c.new_context().is_err());

        c.release_context(id).unwrap();
        assert!(!c.is_valid_context(id));
        assert!(!c.has_valid_context());
        assert!(c.current_context().is_err());
        assert!(c.retrieve_context(id).is_err());
        assert!(c.release_context(id).is_err());
        c.release_context_if_present(id);
        assert_eq!(c.num_autograd_contexts(), 0);
    }

    #[test]
    fn test_get_or_create_leaves_current_alone() {
        let c = container(1);
        let ctx = c.get_or_create_context(17);
        assert!(Arc::ptr_eq(&ctx, &c.get_or_create_context(17)));
        assert!(!c.has_valid_context());
        assert_eq!(c.retrieve_context(17).unwrap().context_id(), 17);
        c.release_context_if_present(17);
        assert!(!c.is_valid_context(17));
    }

    #[test]
    fn test_current_context_id_controls() {
        let c = container(0);
        c.set_current_context_id(5).unwrap();
        c.set_current_context_id(5).unwrap();
        assert!(c.set_current_context_id(6).is_err());
        // Replacing is safe here: context 5 was never registered.
        c.force_current_context_id(6);
        assert_eq!(c.current_context_id(), Some(6));
        assert!(c.current_context().is_err());
        c.clear_current_context();
        assert_eq!(c.current_context_id(), None);
    }

    #[test]
    fn test_scope_releases_on_every_path() {
        let c = container(0);
        let id = {
            let scope = c.scope().unwrap();
            assert_eq!(c.current_context_id(), Some(scope.context_id()));
            scope.context_id()
        };
        assert!(!c.is_valid_context(id));
        assert!(!c.has_valid_context());

        let failing = || -> Result<()> {
            let _scope = c.scope()?;
            Err(Error::invalid_state("forward failed"))
        };
        assert!(failing().is_err());
        assert_eq!(c.num_autograd_contexts(), 0);
        assert!(!c.has_valid_context());
    }

    #[test]
    fn test_concurrent_contexts() {
        let c = Arc::new(container(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let scope = c.scope().unwrap();
                            scope.context_id()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 800);
        assert_eq!(c.num_autograd_contexts(), 0);
    }

    #[test]
    fn test_shard_count() {
        let c = container(0);
        assert_eq!(c.num_shards(), 4);
        for id in 0..64 {
            c.get_or_create_context(id);
        }
        assert!(c.shards.iter().all(|s| !s.contexts.lock().is_empty()));
        assert_eq!(c.num_autograd_contexts(), 64);
        assert_eq!(std::mem::align_of::<ContextShard>(), 64);
    }

    struct CleanupProbe {
        released: Arc<FutureCell<ContextId>>,
    }

    impl RequestHandler for CleanupProbe {
        fn handle(&self, _from: WorkerId, message: Message) -> RpcFuture {
            if let Message::CleanupAutogradContextReq { context_id } = message {
                self.released.complete(Ok(context_id));
            }
            Arc::new(FutureCell::completed(Ok(Message::CleanupAutogradContextResp)))
        }
    }

    #[test]
    fn test_release_broadcasts_to_known_workers() {
        let agents = LocalRpcAgent::create_world(2, &DistAutogradConfig::default()).unwrap();
        let released = Arc::new(FutureCell::new());
        agents[1].set_request_handler(Arc::new(CleanupProbe {
            released: Arc::clone(&released),
        }));

        let c = container(0);
        let agent: Arc<dyn RpcAgent> = agents[0].clone();
        c.set_rpc_agent(&agent).unwrap();
        let remote: Arc<dyn RpcAgent> = agents[1].clone();
        assert!(c.set_rpc_agent(&remote).is_err());

        let ctx = c.new_context().unwrap();
        ctx.add_known_worker_id(0);
        ctx.add_known_worker_id(1);
        c.release_context(ctx.context_id()).unwrap();
        assert_eq!(
            released.wait_timeout(Duration::from_secs(5)),
            Some(Ok(ctx.context_id()))
        );
        agents[0].shutdown();
    }

    #[test]
    fn test_global_instance() {
        let config = DistAutogradConfig::default();
        let first = DistAutogradContainer::init(7, &config).unwrap();
        let again = DistAutogradContainer::init(7, &config).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(DistAutogradContainer::init(8, &config).is_err());
        assert_eq!(DistAutogradContainer::get_instance().unwrap().worker_id(), 7);
    }
}
