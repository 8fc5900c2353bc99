//! Graph Task - State of One Backward Pass
//!
//! A `GraphTask` owns everything a single backward invocation needs:
//! dependency counts, buffers of nodes still waiting for inputs, the set of
//! nodes that must run to reach requested outputs, the captured gradients
//! for those outputs, the outstanding-work counter, the first error, final
//! callbacks, and the future the caller waits on.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use gradnet_core::{current_stream, Device, Error, Result, Stream};
use gradnet_tensor::Tensor;
use parking_lot::Mutex;

use crate::functions::AccumulateGrad;
use crate::future::FutureCell;
use crate::input_buffer::InputBuffer;
use crate::node::{node_id, Edge, NodeId, NodeRef};

// =============================================================================
// Public Types
// =============================================================================

/// Lifecycle of a backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphTaskState {
    /// Work is queued or executing.
    Running,
    /// Every node ran and post-processing succeeded.
    Completed,
    /// A node or post-processing failed.
    Failed,
    /// The pass was cancelled.
    Cancelled,
}

/// Future resolved with the captured gradients of a pass.
pub type GraphTaskFuture = Arc<FutureCell<Vec<Option<Tensor>>>>;

/// Callback run once after a pass finishes all its nodes.
pub type FinalCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Receives gradients bound for leaf accumulators instead of the leaves.
///
/// Distributed passes collect leaf gradients per context rather than into
/// the leaf variables themselves.
pub trait LeafGradSink: Send + Sync {
    /// Accumulates `grad` for the leaf behind `node`.
    fn accumulate(&self, node: &AccumulateGrad, grad: Tensor) -> Result<()>;
}

// =============================================================================
// Execution Info
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct Capture {
    pub(crate) input_nr: usize,
    pub(crate) output_idx: usize,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct ExecInfo {
    pub(crate) needed: bool,
    pub(crate) captures: Vec<Capture>,
}

impl ExecInfo {
    pub(crate) fn should_execute(&self) -> bool {
        self.needed || !self.captures.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct GraphTaskInner {
    pub(crate) dependencies: HashMap<NodeId, usize>,
    pub(crate) not_ready: HashMap<NodeId, (NodeRef, InputBuffer)>,
    /// Empty means every reachable node executes.
    pub(crate) exec_info: HashMap<NodeId, ExecInfo>,
    pub(crate) captured_vars: Vec<Option<Tensor>>,
    pub(crate) leaf_streams: HashSet<Stream>,
    caller_streams: HashMap<Device, Stream>,
    graph_root: Option<NodeRef>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Graph Task
// =============================================================================

/// Shared state of one backward pass.
pub struct GraphTask {
    id: u64,
    keep_graph: bool,
    create_graph: bool,
    exit_on_error: bool,
    reentrant_depth: usize,
    pub(crate) outstanding_tasks: AtomicUsize,
    has_error: AtomicBool,
    cancelled: AtomicBool,
    post_processed: AtomicBool,
    pub(crate) inner: Mutex<GraphTaskInner>,
    final_callbacks: Mutex<Vec<FinalCallback>>,
    future: GraphTaskFuture,
    leaf_sink: Option<Arc<dyn LeafGradSink>>,
    notifier: OnceLock<Arc<dyn Fn() + Send + Sync>>,
}

impl GraphTask {
    /// Creates a pass.
    ///
    /// `keep_graph` keeps saved node state after execution, `create_graph`
    /// records the backward computation itself, and `reentrant_depth` is
    /// the nesting level of the caller.
    #[must_use]
    pub fn new(keep_graph: bool, create_graph: bool, reentrant_depth: usize) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            keep_graph,
            create_graph,
            exit_on_error: false,
            reentrant_depth,
            outstanding_tasks: AtomicUsize::new(0),
            has_error: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            post_processed: AtomicBool::new(false),
            inner: Mutex::new(GraphTaskInner::default()),
            final_callbacks: Mutex::new(Vec::new()),
            future: Arc::new(FutureCell::new()),
            leaf_sink: None,
            notifier: OnceLock::new(),
        }
    }

    /// Routes leaf gradients to `sink` instead of the leaf accumulators.
    #[must_use]
    pub fn with_leaf_sink(mut self, sink: Arc<dyn LeafGradSink>) -> Self {
        self.leaf_sink = Some(sink);
        self
    }

    /// Stops scheduling work once the future resolves, not only on error.
    #[must_use]
    pub fn with_exit_on_error(mut self, exit_on_error: bool) -> Self {
        self.exit_on_error = exit_on_error;
        self
    }

    /// Unique id of this pass within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether saved node state survives execution.
    #[must_use]
    pub fn keep_graph(&self) -> bool {
        self.keep_graph
    }

    /// Whether nodes run with graph recording enabled.
    #[must_use]
    pub fn create_graph(&self) -> bool {
        self.create_graph
    }

    /// Nesting level of the caller that started this pass.
    #[must_use]
    pub fn reentrant_depth(&self) -> usize {
        self.reentrant_depth
    }

    /// The future resolved when the pass finishes.
    #[must_use]
    pub fn future(&self) -> GraphTaskFuture {
        Arc::clone(&self.future)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> GraphTaskState {
        if !self.future.is_completed() {
            GraphTaskState::Running
        } else if self.cancelled.load(Ordering::Acquire) {
            GraphTaskState::Cancelled
        } else if self.future.has_error() {
            GraphTaskState::Failed
        } else {
            GraphTaskState::Completed
        }
    }

    /// Whether the future has resolved.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.future.is_completed()
    }

    /// Whether workers should drop the remaining nodes of this pass.
    #[must_use]
    pub fn exiting(&self) -> bool {
        self.has_error.load(Ordering::Acquire) || (self.exit_on_error && self.is_completed())
    }

    /// Records `error` as the outcome of the pass unless one is already set.
    ///
    /// Nodes already executing finish; queued nodes are dropped.
    pub fn set_error(&self, error: Error) {
        self.has_error.store(true, Ordering::Release);
        if self.future.set_error(error.clone()) {
            tracing::error!(graph_task = self.id, error = %error, "backward pass failed");
        }
        self.notify();
    }

    /// Cancels the pass.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.set_error(Error::Cancelled);
    }

    /// Registers a callback run after all nodes of the pass executed.
    pub fn add_final_callback(&self, callback: FinalCallback) {
        self.final_callbacks.lock().push(callback);
    }

    /// Sink receiving leaf gradients, if any.
    #[must_use]
    pub fn leaf_sink(&self) -> Option<&Arc<dyn LeafGradSink>> {
        self.leaf_sink.as_ref()
    }

    /// Whether the pass only runs the nodes needed for requested outputs.
    #[must_use]
    pub fn has_exec_info(&self) -> bool {
        !self.inner.lock().exec_info.is_empty()
    }

    // =========================================================================
    // Engine-side setup
    // =========================================================================

    pub(crate) fn attach(
        &self,
        graph_root: NodeRef,
        notifier: Arc<dyn Fn() + Send + Sync>,
        num_devices: usize,
    ) {
        let _ = self.notifier.set(notifier);
        let mut inner = self.inner.lock();
        inner.graph_root = Some(graph_root);
        for index in 0..num_devices {
            let device = Device::Cuda(index);
            if let Some(stream) = current_stream(device) {
                inner.caller_streams.insert(device, stream);
            }
        }
    }

    fn notify(&self) {
        if let Some(notify) = self.notifier.get() {
            notify();
        }
    }

    /// Counts, for every node reachable from `root`, the edges pointing at it.
    pub(crate) fn compute_dependencies(&self, root: &NodeRef) {
        let mut dependencies: HashMap<NodeId, usize> = HashMap::new();
        let mut seen = HashSet::from([node_id(root)]);
        let mut stack = vec![Arc::clone(root)];
        while let Some(node) = stack.pop() {
            for next in node.next_edges().iter().filter_map(|e| e.function.as_ref()) {
                let id = node_id(next);
                *dependencies.entry(id).or_insert(0) += 1;
                if seen.insert(id) {
                    stack.push(Arc::clone(next));
                }
            }
        }
        self.inner.lock().dependencies = dependencies;
    }

    /// Marks the nodes that must run to produce gradients for `outputs`.
    ///
    /// Without `accumulate_into_leaves` the gradient flowing into each
    /// output edge is captured and returned by the future, in order.
    pub(crate) fn init_to_execute(
        &self,
        root: &NodeRef,
        outputs: &[Edge],
        accumulate_into_leaves: bool,
    ) {
        let mut exec_info: HashMap<NodeId, ExecInfo> = HashMap::new();
        for (output_idx, edge) in outputs.iter().enumerate() {
            let Some(function) = &edge.function else {
                continue;
            };
            let info = exec_info.entry(node_id(function)).or_default();
            if accumulate_into_leaves {
                info.needed = true;
            } else {
                info.captures.push(Capture {
                    input_nr: edge.input_nr,
                    output_idx,
                });
            }
        }

        // Post-order walk: a node is needed if any child should execute.
        let mut seen = HashSet::from([node_id(root)]);
        let mut stack: Vec<(NodeRef, usize)> = vec![(Arc::clone(root), 0)];
        while let Some((node, child)) = stack.last_mut() {
            let node = Arc::clone(node);
            if let Some(edge) = node.next_edges().get(*child) {
                *child += 1;
                if let Some(next) = &edge.function {
                    if seen.insert(node_id(next)) {
                        stack.push((Arc::clone(next), 0));
                    }
                }
                continue;
            }
            stack.pop();
            let needed = node
                .next_edges()
                .iter()
                .filter_map(|e| e.function.as_ref())
                .any(|next| {
                    exec_info
                        .get(&node_id(next))
                        .is_some_and(ExecInfo::should_execute)
                });
            if needed {
                exec_info.entry(node_id(&node)).or_default().needed = true;
            }
        }

        let mut inner = self.inner.lock();
        inner.exec_info = exec_info;
        if !accumulate_into_leaves {
            inner.captured_vars = vec![None; outputs.len()];
        }
    }

    // =========================================================================
    // Completion
    // =========================================================================

    fn run_post_processing(self: &Arc<Self>) -> Result<Vec<Option<Tensor>>> {
        let captured = {
            let mut inner = self.inner.lock();
            if !inner.not_ready.is_empty() {
                let pending: Vec<&str> = inner.not_ready.values().map(|(n, _)| n.name()).collect();
                return Err(Error::structural(format!(
                    "could not compute gradients for some functions: {}",
                    pending.join(", ")
                )));
            }
            for leaf in &inner.leaf_streams {
                let caller = inner
                    .caller_streams
                    .get(&leaf.device())
                    .copied()
                    .or_else(|| Stream::default_for(leaf.device()));
                if let Some(caller) = caller.filter(|c| c != leaf) {
                    caller.wait_event(&leaf.record_event());
                }
            }
            inner.graph_root = None;
            std::mem::take(&mut inner.captured_vars)
        };

        let _current = CurrentTaskGuard::new(Arc::clone(self));
        loop {
            let callbacks = std::mem::take(&mut *self.final_callbacks.lock());
            if callbacks.is_empty() {
                break;
            }
            for callback in callbacks {
                callback()?;
            }
        }
        Ok(captured)
    }

    /// Runs post-processing once and resolves the future.
    pub(crate) fn mark_as_completed_and_run_post_processing(self: &Arc<Self>) {
        if self.post_processed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.future.is_completed() {
            match self.run_post_processing() {
                Ok(captured) => {
                    self.future.complete(Ok(captured));
                    tracing::debug!(graph_task = self.id, "backward pass completed");
                }
                Err(error) => self.set_error(error),
            }
        }
        self.inner.lock().graph_root = None;
        self.notify();
    }
}

impl std::fmt::Debug for GraphTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("keep_graph", &self.keep_graph)
            .field("create_graph", &self.create_graph)
            .field("reentrant_depth", &self.reentrant_depth)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Current Graph Task
// =============================================================================

thread_local! {
    static CURRENT_GRAPH_TASK: RefCell<Option<Arc<GraphTask>>> = const { RefCell::new(None) };
}

/// The pass whose node or callbacks this thread is executing.
#[must_use]
pub fn current_graph_task() -> Option<Arc<GraphTask>> {
    CURRENT_GRAPH_TASK.with(|t| t.borrow().clone())
}

/// Makes a pass current on this thread; restores the previous one on drop.
pub(crate) struct CurrentTaskGuard {
    prev: Option<Arc<GraphTask>>,
}

impl CurrentTaskGuard {
    pub(crate) fn new(task: Arc<GraphTask>) -> Self {
        let prev = CURRENT_GRAPH_TASK.with(|t| t.borrow_mut().replace(task));
        Self { prev }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_GRAPH_TASK.with(|t| *t.borrow_mut() = prev);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::Identity;
    use crate::node::InputMetadata;

    fn chain() -> (NodeRef, NodeRef, NodeRef) {
        let leaf: NodeRef = Arc::new(Identity::new(vec![], vec![InputMetadata::undefined()]));
        let mid: NodeRef = Arc::new(Identity::new(
            vec![Edge::new(Arc::clone(&leaf), 0)],
            vec![InputMetadata::undefined()],
        ));
        let root: NodeRef = Arc::new(Identity::new(
            vec![Edge::new(Arc::clone(&mid), 0), Edge::new(Arc::clone(&leaf), 0)],
            vec![],
        ));
        (root, mid, leaf)
    }

    #[test]
    fn test_dependencies_count_edges() {
        let (root, mid, leaf) = chain();
        let task = GraphTask::new(false, false, 0);
        task.compute_dependencies(&root);
        let inner = task.inner.lock();
        assert_eq!(inner.dependencies[&node_id(&mid)], 1);
        assert_eq!(inner.dependencies[&node_id(&leaf)], 2);
        assert!(!inner.dependencies.contains_key(&node_id(&root)));
    }

    #[test]
    fn test_init_to_execute_marks_path() {
        let (root, mid, leaf) = chain();
        let task = GraphTask::new(false, false, 0);
        task.init_to_execute(&root, &[Edge::new(Arc::clone(&mid), 0)], false);
        let inner = task.inner.lock();
        assert!(inner.exec_info[&node_id(&root)].needed);
        assert!(!inner.exec_info[&node_id(&mid)].needed);
        assert_eq!(inner.exec_info[&node_id(&mid)].captures.len(), 1);
        assert!(!inner.exec_info.contains_key(&node_id(&leaf)));
        assert_eq!(inner.captured_vars.len(), 1);
    }

    #[test]
    fn test_cancel_sets_state() {
        let task = GraphTask::new(false, false, 0);
        assert_eq!(task.state(), GraphTaskState::Running);
        task.cancel();
        assert_eq!(task.state(), GraphTaskState::Cancelled);
        assert!(task.exiting());
        assert_eq!(task.future().wait().unwrap_err(), Error::Cancelled);
    }

    #[test]
    fn test_first_error_wins() {
        let task = GraphTask::new(false, false, 0);
        task.set_error(Error::structural("first"));
        task.set_error(Error::structural("second"));
        assert_eq!(task.state(), GraphTaskState::Failed);
        assert!(task.future().wait().unwrap_err().to_string().contains("first"));
    }

    #[test]
    fn test_post_processing_runs_callbacks() {
        let task = Arc::new(GraphTask::new(false, false, 0));
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        task.add_final_callback(Box::new(move || {
            f.store(true, Ordering::SeqCst);
            Ok(())
        }));
        task.mark_as_completed_and_run_post_processing();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(task.state(), GraphTaskState::Completed);
    }

    #[test]
    fn test_post_processing_detects_not_ready() {
        let (_, mid, _) = chain();
        let task = Arc::new(GraphTask::new(false, false, 0));
        task.inner
            .lock()
            .not_ready
            .insert(node_id(&mid), (Arc::clone(&mid), InputBuffer::new(1)));
        task.mark_as_completed_and_run_post_processing();
        let err = task.future().wait().unwrap_err();
        assert!(err.to_string().contains("could not compute gradients"));
    }
}
