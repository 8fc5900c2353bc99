//! Engine - Multithreaded Backward Execution
//!
//! Runs backward passes over the node graph. Every device has a ready queue;
//! worker threads pop nodes whose inputs are complete, execute them and
//! route their outputs to downstream input buffers. A node becomes ready
//! when every edge pointing at it has delivered.
//!
//! A backward pass started from inside a node (reentrant backward) is
//! driven by the calling worker itself, which keeps draining its own queue
//! until the nested pass completes. Past `max_recursion_depth` the nested
//! pass is handed to a small pool of reentrant threads instead, so stacks
//! stay bounded.
//!
//! Callers must not hold locks that nodes may need while waiting here.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use gradnet_core::{Device, Error, Result, StreamGuard};
use gradnet_tensor::Tensor;
use parking_lot::{Condvar, Mutex};

use crate::config::EngineConfig;
use crate::functions::{AccumulateGrad, GraphRoot};
use crate::graph_task::{
    current_graph_task, CurrentTaskGuard, ExecInfo, GraphTask, GraphTaskFuture,
};
use crate::input_buffer::InputBuffer;
use crate::no_grad::GradModeGuard;
use crate::node::{node_id, Edge, Node, NodeRef};
use crate::ready_queue::{ReadyQueue, ReadyTask};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Worker Thread State
// =============================================================================

#[derive(Clone)]
struct WorkerState {
    engine_id: u64,
    queue: Arc<ReadyQueue>,
    depth: usize,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerState>> = const { RefCell::new(None) };
}

fn current_worker(engine_id: u64) -> Option<WorkerState> {
    WORKER.with(|w| {
        w.borrow()
            .as_ref()
            .filter(|state| state.engine_id == engine_id)
            .cloned()
    })
}

fn set_worker(state: Option<WorkerState>) {
    WORKER.with(|w| *w.borrow_mut() = state);
}

/// Bumps the worker's nesting depth for the duration of a nested drain.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        WORKER.with(|w| {
            if let Some(state) = w.borrow_mut().as_mut() {
                state.depth += 1;
            }
        });
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        WORKER.with(|w| {
            if let Some(state) = w.borrow_mut().as_mut() {
                state.depth -= 1;
            }
        });
    }
}

// =============================================================================
// Reentrant Pool
// =============================================================================

struct ReentrantJob {
    queue: Arc<ReadyQueue>,
    graph_task: Arc<GraphTask>,
}

#[derive(Default)]
struct PoolState {
    jobs: VecDeque<ReentrantJob>,
    idle: usize,
    threads: usize,
    shutdown: bool,
}

/// Threads that drive nested passes once a worker hit its depth cap.
///
/// Spawned on demand up to the configured size and reused while idle.
#[derive(Default)]
struct ReentrantPool {
    state: Mutex<PoolState>,
    work: Condvar,
}

impl ReentrantPool {
    /// Hands `job` to an idle or newly spawned thread.
    ///
    /// Returns `false` without queuing when every thread is busy and the
    /// pool is full; the caller must then drive the pass itself.
    fn submit(&self, shared: &Arc<EngineShared>, job: ReentrantJob) -> Result<bool> {
        let mut state = self.state.lock();
        if state.idle <= state.jobs.len() {
            if state.threads >= shared.config.reentrant_pool_size {
                return Ok(false);
            }
            let weak = Arc::downgrade(shared);
            let index = state.threads;
            thread::Builder::new()
                .name(format!("gradnet-reentrant-{index}"))
                .spawn(move || reentrant_main(&weak))
                .map_err(|e| Error::invalid_state(format!("failed to spawn reentrant worker: {e}")))?;
            state.threads += 1;
            tracing::debug!(threads = state.threads, "spawned reentrant worker");
        }
        state.jobs.push_back(job);
        self.work.notify_one();
        Ok(true)
    }

    fn next_job(&self) -> Option<ReentrantJob> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.shutdown {
                return None;
            }
            state.idle += 1;
            self.work.wait(&mut state);
            state.idle -= 1;
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.work.notify_all();
    }
}

fn reentrant_main(shared: &Weak<EngineShared>) {
    loop {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let Some(job) = shared.reentrant_pool.next_job() else {
            return;
        };
        set_worker(Some(WorkerState {
            engine_id: shared.id,
            queue: Arc::clone(&job.queue),
            depth: 0,
        }));
        thread_main(&shared, &job.queue, Some(&job.graph_task));
        set_worker(None);
    }
}

// =============================================================================
// Engine
// =============================================================================

struct EngineShared {
    id: u64,
    config: EngineConfig,
    queues: HashMap<Device, Arc<ReadyQueue>>,
    started: OnceLock<Result<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reentrant_pool: ReentrantPool,
}

impl EngineShared {
    fn ready_queue(&self, device: Device) -> Result<Arc<ReadyQueue>> {
        self.queues.get(&device).cloned().ok_or_else(|| {
            Error::invalid_state(format!(
                "no ready queue for {device}; engine manages {} accelerator(s)",
                self.config.num_devices
            ))
        })
    }

    fn wake_all(&self) {
        for queue in self.queues.values() {
            queue.wake_all();
        }
    }
}

/// Executes backward passes on a pool of per-device worker threads.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Creates an engine; workers start on first use.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut queues = HashMap::new();
        queues.insert(Device::Cpu, Arc::new(ReadyQueue::new(Device::Cpu)));
        for index in 0..config.num_devices {
            let device = Device::Cuda(index);
            queues.insert(device, Arc::new(ReadyQueue::new(device)));
        }
        Self {
            shared: Arc::new(EngineShared {
                id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
                config,
                queues,
                started: OnceLock::new(),
                workers: Mutex::new(Vec::new()),
                reentrant_pool: ReentrantPool::default(),
            }),
        }
    }

    /// Process-wide engine with the default configuration.
    pub fn get_default_engine() -> &'static Engine {
        static DEFAULT: OnceLock<Engine> = OnceLock::new();
        DEFAULT.get_or_init(|| Engine::new(EngineConfig::default()))
    }

    /// The configuration this engine runs with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn ensure_started(&self) -> Result<()> {
        self.shared
            .started
            .get_or_init(|| {
                let mut workers = self.shared.workers.lock();
                let mut spawn = |queue: Arc<ReadyQueue>, name: String| -> Result<()> {
                    let shared = Arc::clone(&self.shared);
                    let handle = thread::Builder::new()
                        .name(name)
                        .spawn(move || worker_main(&shared, &queue))
                        .map_err(|e| {
                            Error::invalid_state(format!("failed to spawn engine worker: {e}"))
                        })?;
                    workers.push(handle);
                    Ok(())
                };
                let cpu = self.shared.ready_queue(Device::Cpu)?;
                for i in 0..self.shared.config.cpu_threads {
                    spawn(Arc::clone(&cpu), format!("gradnet-cpu-{i}"))?;
                }
                for index in 0..self.shared.config.num_devices {
                    let device = Device::Cuda(index);
                    spawn(self.shared.ready_queue(device)?, format!("gradnet-{device}"))?;
                }
                tracing::debug!(
                    engine = self.shared.id,
                    cpu_threads = self.shared.config.cpu_threads,
                    devices = self.shared.config.num_devices,
                    "engine workers started"
                );
                Ok(())
            })
            .clone()
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Runs a backward pass from `roots` seeded with `grads`.
    ///
    /// With empty `outputs` every reachable node runs and the result is
    /// empty. Otherwise only nodes leading to `outputs` run; unless
    /// `accumulate_into_leaves` is set the gradient reaching each output
    /// edge is returned, `None` where it was unreachable.
    ///
    /// A single root that is already a [`GraphRoot`] starts the pass as is:
    /// its own outputs seed the graph and the entry of `grads` is only
    /// checked against the root's shape.
    pub fn execute(
        &self,
        roots: &[Edge],
        grads: Vec<Tensor>,
        keep_graph: bool,
        create_graph: bool,
        accumulate_into_leaves: bool,
        outputs: &[Edge],
    ) -> Result<Vec<Option<Tensor>>> {
        validate_roots(roots, &grads)?;
        if let Some(i) = outputs.iter().position(|e| !e.is_valid()) {
            return Err(Error::invalid_state(format!(
                "element {i} of the requested outputs does not require grad"
            )));
        }

        let depth = current_worker(self.shared.id).map_or(0, |w| w.depth + 1);
        let graph_task = Arc::new(GraphTask::new(keep_graph, create_graph, depth));
        // An existing GraphRoot already carries its seed gradients.
        let graph_root: NodeRef = match roots {
            [Edge {
                function: Some(f), ..
            }] if f.as_any().is::<GraphRoot>() => Arc::clone(f),
            _ => Arc::new(GraphRoot::new(roots.to_vec(), grads)),
        };
        graph_task.compute_dependencies(&graph_root);
        if !outputs.is_empty() {
            graph_task.init_to_execute(&graph_root, outputs, accumulate_into_leaves);
        }

        tracing::debug!(
            graph_task = graph_task.id(),
            roots = roots.len(),
            outputs = outputs.len(),
            keep_graph,
            create_graph,
            "starting backward pass"
        );
        let inputs = InputBuffer::new(graph_root.num_inputs());
        self.execute_with_graph_task(&graph_task, graph_root, inputs)?;
        self.wait_for(&graph_task)
    }

    /// Starts `graph_task` at `graph_root` with `inputs` and returns its future.
    ///
    /// Dependencies are computed here if the caller did not. Does not
    /// block; use [`Engine::wait_for`] to drive the pass from a worker.
    pub fn execute_with_graph_task(
        &self,
        graph_task: &Arc<GraphTask>,
        graph_root: NodeRef,
        inputs: InputBuffer,
    ) -> Result<GraphTaskFuture> {
        self.ensure_started()?;
        if graph_task.inner.lock().dependencies.is_empty() {
            graph_task.compute_dependencies(&graph_root);
        }
        let weak = Arc::downgrade(&self.shared);
        graph_task.attach(
            Arc::clone(&graph_root),
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.wake_all();
                }
            }),
            self.shared.config.num_devices,
        );
        let queue = self.shared.ready_queue(inputs.device())?;
        graph_task.outstanding_tasks.fetch_add(1, Ordering::AcqRel);
        queue.push(ReadyTask::node(Arc::clone(graph_task), graph_root, inputs));
        Ok(graph_task.future())
    }

    /// Blocks until `graph_task` finishes.
    ///
    /// On a worker thread of this engine the caller keeps executing queued
    /// nodes meanwhile, or hands the pass to the reentrant pool past the
    /// depth cap. A full pool never parks the caller: it drains inline.
    pub fn wait_for(&self, graph_task: &Arc<GraphTask>) -> Result<Vec<Option<Tensor>>> {
        if let Some(worker) = current_worker(self.shared.id) {
            let drain_inline = worker.depth < self.shared.config.max_recursion_depth || {
                tracing::debug!(
                    graph_task = graph_task.id(),
                    depth = worker.depth,
                    "recursion cap reached, using reentrant pool"
                );
                let accepted = self.shared.reentrant_pool.submit(
                    &self.shared,
                    ReentrantJob {
                        queue: Arc::clone(&worker.queue),
                        graph_task: Arc::clone(graph_task),
                    },
                )?;
                if !accepted {
                    tracing::warn!(
                        graph_task = graph_task.id(),
                        limit = self.shared.config.reentrant_pool_size,
                        "reentrant pool saturated, draining nested backward inline"
                    );
                }
                !accepted
            };
            if drain_inline {
                let _depth = DepthGuard::enter();
                thread_main(&self.shared, &worker.queue, Some(graph_task));
            }
        }
        graph_task.future().wait()
    }

    /// Registers `callback` to run once the current pass finishes its nodes.
    ///
    /// Only valid on a thread executing a node of a pass.
    pub fn queue_callback(callback: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        let graph_task = current_graph_task().ok_or_else(|| {
            Error::invalid_state("final callbacks can only be installed during the backward pass")
        })?;
        graph_task.add_final_callback(Box::new(callback));
        Ok(())
    }

    /// Whether recomputation-based checkpointing may run on this thread.
    ///
    /// False inside a pass restricted to requested outputs.
    #[must_use]
    pub fn is_checkpoint_valid() -> bool {
        current_graph_task().map_or(true, |task| !task.has_exec_info())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.reentrant_pool.shutdown();
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        if workers.is_empty() {
            return;
        }
        if let Ok(cpu) = self.shared.ready_queue(Device::Cpu) {
            for _ in 0..self.shared.config.cpu_threads {
                cpu.push_shutdown();
            }
        }
        for index in 0..self.shared.config.num_devices {
            if let Ok(queue) = self.shared.ready_queue(Device::Cuda(index)) {
                queue.push_shutdown();
            }
        }
        if current_worker(self.shared.id).is_some() {
            return;
        }
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_roots(roots: &[Edge], grads: &[Tensor]) -> Result<()> {
    if roots.len() != grads.len() {
        return Err(Error::structural(format!(
            "got {} roots but {} gradients",
            roots.len(),
            grads.len()
        )));
    }
    for (i, (root, grad)) in roots.iter().zip(grads).enumerate() {
        let Some(function) = &root.function else {
            return Err(Error::invalid_state(format!(
                "element {i} of tensors does not require grad and does not have a grad_fn"
            )));
        };
        if let Some(meta) = function.input_metadata(root.input_nr) {
            if meta.is_defined() && meta.shape() != grad.shape() {
                return Err(Error::invalid_state(format!(
                    "mismatch in shape: grad_output[{i}] has a shape of {:?} and output[{i}] has a shape of {:?}",
                    grad.shape(),
                    meta.shape()
                )));
            }
        }
    }
    Ok(())
}

/// Checks a node's outputs against the slots they are routed to.
///
/// Gradients on the wrong device are moved to the consumer's device.
fn validate_outputs(node: &dyn Node, outputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
    let edges = node.next_edges();
    if outputs.len() != edges.len() {
        return Err(Error::structural(format!(
            "function {} returned an incorrect number of gradients (expected {}, got {})",
            node.name(),
            edges.len(),
            outputs.len()
        )));
    }
    outputs
        .into_iter()
        .zip(edges)
        .enumerate()
        .map(|(i, (grad, edge))| {
            let (Some(grad), Some(next)) = (grad, &edge.function) else {
                return Ok(None);
            };
            let Some(meta) = next.input_metadata(edge.input_nr) else {
                return Err(Error::structural(format!(
                    "edge {i} of {} targets input {} of {}, which has {} inputs",
                    node.name(),
                    edge.input_nr,
                    next.name(),
                    next.num_inputs()
                )));
            };
            if !meta.is_defined() {
                return Ok(Some(grad));
            }
            if meta.shape() != grad.shape() {
                return Err(Error::compute(
                    node.name(),
                    format!(
                        "invalid gradient at index {i} - got {:?} but expected shape compatible with {:?}",
                        grad.shape(),
                        meta.shape()
                    ),
                ));
            }
            if meta.device() == grad.device() {
                Ok(Some(grad))
            } else {
                Ok(Some(grad.to_device(meta.device())))
            }
        })
        .collect()
}

// =============================================================================
// Worker Loop
// =============================================================================

fn worker_main(shared: &Arc<EngineShared>, queue: &Arc<ReadyQueue>) {
    set_worker(Some(WorkerState {
        engine_id: shared.id,
        queue: Arc::clone(queue),
        depth: 0,
    }));
    thread_main(shared, queue, None);
    set_worker(None);
    tracing::debug!(device = %queue.device(), "engine worker exiting");
}

/// Pops and runs tasks from `queue`.
///
/// Without `nested` the loop runs until shutdown; with it, until that pass
/// completes.
fn thread_main(shared: &Arc<EngineShared>, queue: &Arc<ReadyQueue>, nested: Option<&Arc<GraphTask>>) {
    let stop = || nested.is_some_and(|task| task.is_completed());
    loop {
        let Some(task) = queue.pop_until(&stop) else {
            return;
        };
        let ReadyTask::Node {
            graph_task,
            node,
            inputs,
        } = task
        else {
            if nested.is_some() {
                queue.push_shutdown();
            }
            return;
        };

        if !graph_task.exiting() {
            let _current = CurrentTaskGuard::new(Arc::clone(&graph_task));
            if let Err(error) = evaluate_function(shared, &graph_task, &node, inputs) {
                tracing::debug!(
                    graph_task = graph_task.id(),
                    node = node.name(),
                    error = %error,
                    "node failed"
                );
                graph_task.set_error(error);
            }
        }

        if graph_task.outstanding_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            graph_task.mark_as_completed_and_run_post_processing();
        }
    }
}

// =============================================================================
// Node Evaluation
// =============================================================================

fn evaluate_function(
    shared: &EngineShared,
    graph_task: &Arc<GraphTask>,
    node: &NodeRef,
    inputs: InputBuffer,
) -> Result<()> {
    {
        let mut inner = graph_task.inner.lock();
        if !inner.exec_info.is_empty() {
            let info = inner.exec_info.get(&node_id(node)).cloned().unwrap_or_default();
            for capture in &info.captures {
                let grad = inputs.get(capture.input_nr).cloned();
                if let Some(slot) = inner.captured_vars.get_mut(capture.output_idx) {
                    *slot = grad;
                }
            }
            if !info.needed {
                return Ok(());
            }
        }
    }

    if let Some(sink) = graph_task.leaf_sink() {
        if let Some(accumulate) = node.as_any().downcast_ref::<AccumulateGrad>() {
            let inputs = node.base().call_pre_hooks(inputs.into_inputs());
            if let Some(Some(grad)) = inputs.into_iter().next() {
                sink.accumulate(accumulate, grad)?;
            }
            return Ok(());
        }
    }

    let device = inputs.device();
    let outputs = call_function(graph_task, node, inputs, device)?;

    if node.num_outputs() == 0 {
        if let Some(stream) = node.stream(device) {
            graph_task.inner.lock().leaf_streams.insert(stream);
        }
        return Ok(());
    }

    route_outputs(shared, graph_task, node, outputs, device)
}

fn call_function(
    graph_task: &GraphTask,
    node: &NodeRef,
    inputs: InputBuffer,
    device: Device,
) -> Result<Vec<Option<Tensor>>> {
    let mut inputs = node.base().call_pre_hooks(inputs.into_inputs());
    if inputs.len() != node.num_inputs() {
        return Err(Error::structural(format!(
            "{} expects {} inputs, got {}",
            node.name(),
            node.num_inputs(),
            inputs.len()
        )));
    }
    if !node.accepts_undefined_inputs() {
        for (slot, meta) in inputs.iter_mut().zip(node.base().input_metadata()) {
            if slot.is_none() {
                *slot = meta.zeros_like();
            }
        }
    }

    let saved_inputs = node.base().has_post_hooks().then(|| inputs.clone());
    let outputs = {
        let _grad_mode = GradModeGuard::new(graph_task.create_graph());
        let _stream = node.stream(device).map(StreamGuard::new);
        node.apply(inputs).map_err(|e| e.in_node(node.name()))?
    };
    let outputs = validate_outputs(node.as_ref(), outputs)?;

    if let Some(inputs) = saved_inputs {
        node.base().call_post_hooks(&inputs, &outputs);
    }
    if !graph_task.keep_graph() {
        node.release_variables();
    }
    Ok(outputs)
}

fn route_outputs(
    shared: &EngineShared,
    graph_task: &Arc<GraphTask>,
    node: &NodeRef,
    outputs: Vec<Option<Tensor>>,
    device: Device,
) -> Result<()> {
    let parent_stream = node.stream(device);
    let mut ready = Vec::new();
    {
        let mut inner = graph_task.inner.lock();
        for (output, edge) in outputs.into_iter().zip(node.next_edges()) {
            let Some(next) = &edge.function else {
                continue;
            };
            let id = node_id(next);

            let is_ready = match inner.dependencies.get_mut(&id) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => {
                    return Err(Error::structural(format!(
                        "dependency not found for {}",
                        next.name()
                    )))
                }
            };
            if is_ready {
                inner.dependencies.remove(&id);
            }

            let next_stream = output.as_ref().and_then(|t| next.stream(t.device()));
            if let Some((_, buffer)) = inner.not_ready.get_mut(&id) {
                buffer.add(edge.input_nr, output, parent_stream, next_stream)?;
                if is_ready {
                    if let Some(entry) = inner.not_ready.remove(&id) {
                        ready.push(entry);
                    }
                }
                continue;
            }

            if !inner.exec_info.is_empty()
                && !inner.exec_info.get(&id).is_some_and(ExecInfo::should_execute)
            {
                continue;
            }
            let mut buffer = InputBuffer::new(next.num_inputs());
            buffer.add(edge.input_nr, output, parent_stream, next_stream)?;
            if is_ready {
                ready.push((Arc::clone(next), buffer));
            } else {
                inner.not_ready.insert(id, (Arc::clone(next), buffer));
            }
        }
    }

    for (next, buffer) in ready {
        let queue = shared.ready_queue(buffer.device())?;
        tracing::trace!(
            node = next.name(),
            device = %queue.device(),
            queued = queue.len(),
            "node ready"
        );
        graph_task.outstanding_tasks.fetch_add(1, Ordering::AcqRel);
        queue.push(ReadyTask::node(Arc::clone(graph_task), next, buffer));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{AddBackward, ErrorNode, Identity};
    use crate::graph_task::GraphTaskState;
    use crate::node::{InputMetadata, NodeBase};
    use crate::variable::Variable;
    use gradnet_core::ErrorKind;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    fn engine(cpu_threads: usize) -> Engine {
        Engine::new(EngineConfig {
            cpu_threads,
            ..EngineConfig::default()
        })
    }

    fn scalar_leaf(value: f32) -> Variable {
        Variable::new(Tensor::scalar(value), true)
    }

    #[test]
    fn test_simple_chain() {
        let engine = engine(2);
        let x = scalar_leaf(3.0);
        let y = x.mul_scalar(2.0).sum();
        engine
            .execute(&[y.gradient_edge()], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn test_diamond_accumulates() {
        // y = x*x + x  ->  dy/dx = 2x + 1
        let engine = engine(4);
        let x = scalar_leaf(3.0);
        let y = x.mul(&x).unwrap().add(&x).unwrap();
        engine
            .execute(&[y.gradient_edge()], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 7.0);
    }

    #[test]
    fn test_requested_outputs_are_captured() {
        let engine = engine(2);
        let a = scalar_leaf(2.0);
        let b = scalar_leaf(5.0);
        let y = a.mul(&b).unwrap();
        let grads = engine
            .execute(
                &[y.gradient_edge()],
                vec![Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[a.gradient_edge(), b.gradient_edge()],
            )
            .unwrap();
        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 5.0);
        assert_eq!(grads[1].as_ref().unwrap().item().unwrap(), 2.0);
        assert!(a.grad().is_none());
    }

    #[test]
    fn test_unreachable_output_is_undefined() {
        let engine = engine(1);
        let a = scalar_leaf(2.0);
        let other = scalar_leaf(1.0);
        let y = a.mul_scalar(3.0);
        let grads = engine
            .execute(
                &[y.gradient_edge()],
                vec![Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[other.gradient_edge()],
            )
            .unwrap();
        assert_eq!(grads, vec![None]);
    }

    #[test]
    fn test_output_without_grad_is_rejected() {
        let engine = engine(1);
        let a = scalar_leaf(2.0);
        let frozen = Variable::new(Tensor::scalar(1.0), false);
        let y = a.mul_scalar(3.0);
        let err = engine
            .execute(
                &[y.gradient_edge()],
                vec![Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[frozen.gradient_edge()],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_root_validation() {
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let err = engine
            .execute(&[x.gradient_edge()], vec![], false, false, false, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);

        let bad = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let err = engine
            .execute(&[x.gradient_edge()], vec![bad], false, false, false, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_second_pass_without_keep_graph_fails() {
        let engine = engine(1);
        let a = scalar_leaf(2.0);
        let y = a.mul(&a).unwrap();
        let root = [y.gradient_edge()];
        engine
            .execute(&root, vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        let err = engine
            .execute(&root, vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert!(err.to_string().contains("second time"));
    }

    #[test]
    fn test_keep_graph_allows_second_pass() {
        let engine = engine(1);
        let a = scalar_leaf(2.0);
        let y = a.mul(&a).unwrap();
        let root = [y.gradient_edge()];
        engine
            .execute(&root, vec![Tensor::scalar(1.0)], true, false, false, &[])
            .unwrap();
        engine
            .execute(&root, vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(a.grad().unwrap().item().unwrap(), 8.0);
    }

    #[test]
    fn test_error_propagates_and_drains() {
        let engine = engine(2);
        let x = scalar_leaf(1.0);
        let failing: NodeRef = Arc::new(ErrorNode::new("boom", vec![x.gradient_edge()]));
        let err = engine
            .execute(
                &[Edge::new(failing, 0)],
                vec![Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert!(err.to_string().contains("boom"));
        assert!(x.grad().is_none());
    }

    /// Produces a gradient only for its second output.
    struct Sparse {
        base: NodeBase,
    }

    impl Node for Sparse {
        fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
            Ok(vec![None, Some(Tensor::scalar(1.0))])
        }
        fn name(&self) -> &'static str {
            "Sparse"
        }
        fn base(&self) -> &NodeBase {
            &self.base
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_undefined_inputs_are_zero_filled() {
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let seen = Arc::new(Mutex::new(None));
        let add: NodeRef = Arc::new(AddBackward::new(
            x.gradient_edge(),
            Edge::empty(),
            InputMetadata::new(&[], Device::Cpu),
        ));
        let s = Arc::clone(&seen);
        add.base().add_pre_hook(Box::new(move |inputs| {
            *s.lock() = Some(inputs.clone());
            inputs
        }));
        let sparse: NodeRef = Arc::new(Sparse {
            base: NodeBase::new(
                vec![Edge::new(Arc::clone(&add), 0), Edge::empty()],
                vec![InputMetadata::new(&[], Device::Cpu)],
            ),
        });
        engine
            .execute(&[Edge::new(sparse, 0)], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        // AddBackward saw an undefined slot, then received zeros.
        assert_eq!(*seen.lock(), Some(vec![None]));
        assert_eq!(x.grad().unwrap().item().unwrap(), 0.0);
    }

    #[test]
    fn test_final_callback_runs_after_nodes() {
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let identity: NodeRef = Arc::new(Identity::new(
            vec![x.gradient_edge()],
            vec![InputMetadata::new(&[], Device::Cpu)],
        ));
        identity.base().add_post_hook(Box::new(move |_, _| {
            let r = Arc::clone(&r);
            Engine::queue_callback(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }));
        engine
            .execute(&[Edge::new(identity, 0)], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(Engine::queue_callback(|| Ok(())).is_err());
    }

    #[test]
    fn test_checkpoint_valid_outside_pass() {
        assert!(Engine::is_checkpoint_valid());
    }

    /// Runs a nested backward through the engine when applied.
    struct Reentrant {
        base: NodeBase,
        engine: Arc<Engine>,
        levels: usize,
        leaf: Variable,
    }

    impl Node for Reentrant {
        fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
            if self.levels > 0 {
                let inner: NodeRef = Arc::new(Reentrant {
                    base: NodeBase::new(vec![], vec![InputMetadata::new(&[], Device::Cpu)]),
                    engine: Arc::clone(&self.engine),
                    levels: self.levels - 1,
                    leaf: self.leaf.clone(),
                });
                self.engine.execute(
                    &[Edge::new(inner, 0)],
                    vec![Tensor::scalar(1.0)],
                    false,
                    false,
                    false,
                    &[],
                )?;
            } else {
                let y = self.leaf.mul_scalar(1.0);
                self.engine.execute(
                    &[y.gradient_edge()],
                    vec![Tensor::scalar(1.0)],
                    false,
                    false,
                    false,
                    &[],
                )?;
            }
            Ok(Vec::new())
        }
        fn name(&self) -> &'static str {
            "Reentrant"
        }
        fn base(&self) -> &NodeBase {
            &self.base
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_reentrant_backward_beyond_recursion_cap() {
        let engine = Arc::new(Engine::new(EngineConfig {
            cpu_threads: 1,
            max_recursion_depth: 2,
            reentrant_pool_size: 4,
            ..EngineConfig::default()
        }));
        let leaf = scalar_leaf(1.0);
        let root: NodeRef = Arc::new(Reentrant {
            base: NodeBase::new(vec![], vec![InputMetadata::new(&[], Device::Cpu)]),
            engine: Arc::clone(&engine),
            levels: 5,
            leaf: leaf.clone(),
        });
        engine
            .execute(&[Edge::new(root, 0)], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(leaf.grad().unwrap().item().unwrap(), 1.0);
    }

    #[test]
    fn test_concurrent_producers_on_many_workers() {
        let engine = engine(8);
        let x = scalar_leaf(1.0);
        let branches: Vec<Variable> = (0..64).map(|i| x.mul_scalar(i as f32)).collect();
        let mut total = branches[0].clone();
        for b in &branches[1..] {
            total = total.add(b).unwrap();
        }
        engine
            .execute(&[total.gradient_edge()], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        let expected: f32 = (0..64).map(|i| i as f32).sum();
        assert_eq!(x.grad().unwrap().item().unwrap(), expected);
    }

    #[test]
    fn test_accelerator_queue() {
        let engine = Engine::new(EngineConfig {
            cpu_threads: 1,
            num_devices: 1,
            ..EngineConfig::default()
        });
        let x = Variable::new(Tensor::scalar(2.0).to_device(Device::Cuda(0)), true);
        let y = x.mul_scalar(4.0);
        engine
            .execute(
                &[y.gradient_edge()],
                vec![Tensor::scalar(1.0).to_device(Device::Cuda(0))],
                false,
                false,
                false,
                &[],
            )
            .unwrap();
        let grad = x.grad().unwrap();
        assert_eq!(grad.device(), Device::Cuda(0));
        assert_eq!(grad.item().unwrap(), 4.0);
    }

    #[test]
    fn test_unmanaged_device_is_rejected() {
        let engine = engine(1);
        let x = Variable::new(Tensor::scalar(2.0).to_device(Device::Cuda(7)), true);
        let y = x.mul_scalar(4.0);
        let err = engine
            .execute(
                &[y.gradient_edge()],
                vec![Tensor::scalar(1.0).to_device(Device::Cuda(7))],
                false,
                false,
                false,
                &[],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_graph_task_state_after_execute() {
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let y = x.mul_scalar(2.0);
        let task = Arc::new(GraphTask::new(false, false, 0));
        let root: NodeRef = Arc::new(GraphRoot::new(vec![y.gradient_edge()], vec![Tensor::scalar(1.0)]));
        let future = engine
            .execute_with_graph_task(&task, root, InputBuffer::new(1))
            .unwrap();
        future.wait().unwrap();
        assert_eq!(task.state(), GraphTaskState::Completed);
        assert_eq!(x.grad().unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn test_existing_graph_root_uses_its_own_seeds() {
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let root: NodeRef = Arc::new(GraphRoot::new(
            vec![x.mul_scalar(2.0).gradient_edge()],
            vec![Tensor::scalar(5.0)],
        ));
        engine
            .execute(&[Edge::new(root, 0)], vec![Tensor::scalar(1.0)], false, false, false, &[])
            .unwrap();
        assert_eq!(x.grad().unwrap().item().unwrap(), 10.0);
    }

    #[test]
    fn test_saturated_reentrant_pool_drains_inline() {
        let engine = Arc::new(Engine::new(EngineConfig {
            cpu_threads: 1,
            max_recursion_depth: 1,
            reentrant_pool_size: 1,
            ..EngineConfig::default()
        }));
        let leaf = scalar_leaf(1.0);
        let root: NodeRef = Arc::new(Reentrant {
            base: NodeBase::new(vec![], vec![InputMetadata::new(&[], Device::Cpu)]),
            engine: Arc::clone(&engine),
            levels: 5,
            leaf: leaf.clone(),
        });

        let (done, outcome) = std::sync::mpsc::channel();
        let runner = Arc::clone(&engine);
        thread::spawn(move || {
            let result = runner.execute(
                &[Edge::new(root, 0)],
                vec![Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[],
            );
            let _ = done.send(result);
        });
        let result = outcome
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("nested backward did not finish");
        result.unwrap();
        assert_eq!(leaf.grad().unwrap().item().unwrap(), 1.0);
    }

    /// Counts its applications; fails with `fail` when set.
    struct Counting {
        base: NodeBase,
        calls: AtomicUsize,
        fail: Option<&'static str>,
    }

    impl Counting {
        fn new(next_edges: Vec<Edge>, fail: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                base: NodeBase::new(next_edges, vec![InputMetadata::new(&[], Device::Cpu)]),
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Node for Counting {
        fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.fail {
                return Err(Error::compute(self.name(), message));
            }
            let grad = inputs.into_iter().next().flatten();
            Ok(self.next_edges().iter().map(|_| grad.clone()).collect())
        }
        fn name(&self) -> &'static str {
            "Counting"
        }
        fn base(&self) -> &NodeBase {
            &self.base
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn edge_to(node: &Arc<Counting>) -> Edge {
        Edge::new(Arc::clone(node) as NodeRef, 0)
    }

    #[test]
    fn test_shared_node_runs_once_under_concurrent_producers() {
        let engine = engine(8);
        let x = scalar_leaf(1.0);
        let shared = Counting::new(vec![x.gradient_edge()], None);
        // Feeds the shared node but is not reachable from the roots.
        let orphan = Counting::new(vec![edge_to(&shared)], None);

        let producers: Vec<Edge> = (0..64)
            .map(|_| {
                let producer: NodeRef = Arc::new(Identity::new(
                    vec![edge_to(&shared)],
                    vec![InputMetadata::new(&[], Device::Cpu)],
                ));
                Edge::new(producer, 0)
            })
            .collect();
        engine
            .execute(&producers, vec![Tensor::scalar(1.0); 64], false, false, false, &[])
            .unwrap();

        assert_eq!(shared.calls(), 1);
        assert_eq!(orphan.calls(), 0);
        assert_eq!(x.grad().unwrap().item().unwrap(), 64.0);
    }

    #[test]
    fn test_pruned_branch_never_runs() {
        let engine = engine(2);
        let a = scalar_leaf(1.0);
        let b = scalar_leaf(1.0);
        let needed = Counting::new(vec![a.gradient_edge()], None);
        let pruned = Counting::new(vec![b.gradient_edge()], None);
        let grads = engine
            .execute(
                &[edge_to(&needed), edge_to(&pruned)],
                vec![Tensor::scalar(3.0), Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[a.gradient_edge()],
            )
            .unwrap();

        assert_eq!(grads[0].as_ref().unwrap().item().unwrap(), 3.0);
        assert_eq!(needed.calls(), 1);
        assert_eq!(pruned.calls(), 0);
        assert!(b.grad().is_none());
    }

    #[test]
    fn test_first_error_wins_over_queued_sibling() {
        // One worker pops later nodes first, so `failing` runs before
        // `sibling` while both sit in the queue.
        let engine = engine(1);
        let x = scalar_leaf(1.0);
        let sibling = Counting::new(vec![x.gradient_edge()], Some("second"));
        let failing = Counting::new(vec![x.gradient_edge()], Some("first"));

        let err = engine
            .execute(
                &[edge_to(&sibling), edge_to(&failing)],
                vec![Tensor::scalar(1.0), Tensor::scalar(1.0)],
                false,
                false,
                false,
                &[],
            )
            .unwrap_err();

        assert_eq!(err, Error::compute("Counting", "first"));
        assert_eq!(failing.calls(), 1);
        assert_eq!(sibling.calls(), 0);
        assert!(x.grad().is_none());
    }
}
