//! Context - State of One Distributed Backward Pass on One Worker
//!
//! A context groups the send and recv boundary nodes recorded during the
//! forward pass, the workers that took part, the leaf gradients collected
//! during backward and the RPCs still in flight. A single lock guards it
//! and is never held across a wait.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use gradnet_autograd::functions::AccumulateGrad;
use gradnet_autograd::{FutureCell, GraphTask, LeafGradSink, VariableId};
use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;
use parking_lot::Mutex;

use crate::functions::{RecvRpcBackward, SendRpcBackward};
use crate::rpc::RpcFuture;
use crate::{ContextId, MessageId, WorkerId};

#[derive(Default)]
struct ContextState {
    known_worker_ids: HashSet<WorkerId>,
    send_functions: HashMap<MessageId, Arc<SendRpcBackward>>,
    recv_functions: HashMap<MessageId, Arc<RecvRpcBackward>>,
    accumulated_grads: HashMap<VariableId, Tensor>,
    outstanding_rpcs: HashMap<Option<u64>, Vec<RpcFuture>>,
    graph_task: Option<Arc<GraphTask>>,
}

// =============================================================================
// Distributed Autograd Context
// =============================================================================

/// Per-worker state of one distributed backward pass.
pub struct DistAutogradContext {
    context_id: ContextId,
    state: Mutex<ContextState>,
}

impl DistAutogradContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(context_id: ContextId) -> Self {
        Self {
            context_id,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Id of the pass.
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    // =========================================================================
    // Participants and Boundary Nodes
    // =========================================================================

    /// Records that `worker_id` takes part in this pass.
    pub fn add_known_worker_id(&self, worker_id: WorkerId) {
        self.state.lock().known_worker_ids.insert(worker_id);
    }

    /// Workers to notify when the context is released.
    #[must_use]
    pub fn known_worker_ids(&self) -> HashSet<WorkerId> {
        self.state.lock().known_worker_ids.clone()
    }

    /// Registers the send node created for autograd message `message_id`.
    pub fn add_send_function(&self, send: Arc<SendRpcBackward>, message_id: MessageId) -> Result<()> {
        let mut state = self.state.lock();
        if state.send_functions.contains_key(&message_id) {
            return Err(Error::structural(format!(
                "send function for message {message_id} already registered in context {}",
                self.context_id
            )));
        }
        state.send_functions.insert(message_id, send);
        Ok(())
    }

    /// Registers the recv node created for autograd message `message_id`.
    pub fn add_recv_function(&self, recv: Arc<RecvRpcBackward>, message_id: MessageId) -> Result<()> {
        let mut state = self.state.lock();
        if state.recv_functions.contains_key(&message_id) {
            return Err(Error::structural(format!(
                "recv function for message {message_id} already registered in context {}",
                self.context_id
            )));
        }
        state.recv_functions.insert(message_id, recv);
        Ok(())
    }

    /// All send nodes, by message id.
    #[must_use]
    pub fn send_functions(&self) -> HashMap<MessageId, Arc<SendRpcBackward>> {
        self.state.lock().send_functions.clone()
    }

    /// All recv nodes, by message id.
    #[must_use]
    pub fn recv_functions(&self) -> HashMap<MessageId, Arc<RecvRpcBackward>> {
        self.state.lock().recv_functions.clone()
    }

    /// Send node for `message_id`.
    pub fn retrieve_send_function(&self, message_id: MessageId) -> Result<Arc<SendRpcBackward>> {
        self.state
            .lock()
            .send_functions
            .get(&message_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "could not find send function for message {message_id} in context {}",
                    self.context_id
                ))
            })
    }

    // =========================================================================
    // Gradients
    // =========================================================================

    /// Adds `grad` to the gradient collected for `variable_id`.
    pub fn accumulate_grad(&self, variable_id: VariableId, grad: Tensor) -> Result<()> {
        let mut state = self.state.lock();
        let sum = match state.accumulated_grads.get(&variable_id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        state.accumulated_grads.insert(variable_id, sum);
        Ok(())
    }

    /// Leaf gradients collected so far, by variable id.
    #[must_use]
    pub fn get_gradients(&self) -> HashMap<VariableId, Tensor> {
        self.state.lock().accumulated_grads.clone()
    }

    // =========================================================================
    // Graph Task and Outstanding RPCs
    // =========================================================================

    /// Records `graph_task` as this context's pass.
    ///
    /// Fails if a pass is already recorded.
    pub fn set_graph_task(&self, graph_task: Arc<GraphTask>) -> Result<()> {
        let mut state = self.state.lock();
        if state.graph_task.is_some() {
            return Err(Error::invalid_state(format!(
                "a backward pass is already running for context {}",
                self.context_id
            )));
        }
        state.graph_task = Some(graph_task);
        Ok(())
    }

    /// The recorded pass, if any.
    #[must_use]
    pub fn retrieve_graph_task(&self) -> Option<Arc<GraphTask>> {
        self.state.lock().graph_task.clone()
    }

    /// Forgets the recorded pass.
    pub fn reset_graph_task(&self) {
        self.state.lock().graph_task = None;
    }

    /// Tracks an RPC sent by a node of `graph_task`.
    ///
    /// A failure of `future` fails `graph_task`, or the recorded pass when
    /// the RPC was sent outside one.
    pub fn add_outstanding_rpc(self: &Arc<Self>, graph_task: Option<Arc<GraphTask>>, future: RpcFuture) {
        let key = graph_task.as_ref().map(|task| task.id());
        let weak = Arc::downgrade(self);
        future.then(move |outcome| {
            if let Err(e) = outcome {
                if let Some(context) = weak.upgrade() {
                    tracing::error!(context_id = context.context_id, error = %e, "rpc failed");
                    if let Some(graph_task) = graph_task.or_else(|| context.retrieve_graph_task()) {
                        graph_task.set_error(e.clone());
                    }
                }
            }
        });
        self.state
            .lock()
            .outstanding_rpcs
            .entry(key)
            .or_default()
            .push(future);
    }

    /// Number of RPCs not yet collected.
    #[must_use]
    pub fn num_outstanding_rpcs(&self) -> usize {
        self.state.lock().outstanding_rpcs.values().map(Vec::len).sum()
    }

    /// Takes the outstanding RPCs sent by graph task `graph_task_id` and
    /// returns a future resolved once all of them have, with the first
    /// error if any failed.
    ///
    /// Passes on the same context started by other workers keep their own
    /// RPCs, so a worker serving its own pass never waits on itself.
    #[must_use]
    pub fn clear_and_wait_for_outstanding_rpcs(&self, graph_task_id: Option<u64>) -> Arc<FutureCell<()>> {
        let outstanding = self
            .state
            .lock()
            .outstanding_rpcs
            .remove(&graph_task_id)
            .unwrap_or_default();
        let all_done = Arc::new(FutureCell::new());
        if outstanding.is_empty() {
            all_done.complete(Ok(()));
            return all_done;
        }

        let remaining = Arc::new(Mutex::new((outstanding.len(), None::<Error>)));
        for future in outstanding {
            let remaining = Arc::clone(&remaining);
            let all_done = Arc::clone(&all_done);
            future.then(move |outcome| {
                let mut guard = remaining.lock();
                let (count, first_error) = &mut *guard;
                if let Err(e) = outcome {
                    first_error.get_or_insert_with(|| e.clone());
                }
                *count -= 1;
                if *count == 0 {
                    let result = first_error.take().map_or(Ok(()), Err);
                    drop(guard);
                    all_done.complete(result);
                }
            });
        }
        all_done
    }
}

impl LeafGradSink for DistAutogradContext {
    fn accumulate(&self, node: &AccumulateGrad, grad: Tensor) -> Result<()> {
        self.accumulate_grad(node.variable_id(), grad)
    }
}

impl std::fmt::Debug for DistAutogradContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DistAutogradContext")
            .field("context_id", &self.context_id)
            .field("known_worker_ids", &state.known_worker_ids)
            .field("send_functions", &state.send_functions.len())
            .field("recv_functions", &state.recv_functions.len())
            .field(
                "outstanding_rpcs",
                &state.outstanding_rpcs.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
