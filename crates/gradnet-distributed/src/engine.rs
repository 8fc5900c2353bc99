//! Distributed Engine - Backward Passes Spanning Workers
//!
//! Drives the local part of a distributed backward pass on the local
//! [`Engine`]. Leaf gradients go to the pass's context instead of the
//! leaves, recv nodes forward gradients to the workers that sent their
//! tensors, and a pass only finishes once every gradient it sent has been
//! fully processed downstream.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use gradnet_autograd::functions::GraphRoot;
use gradnet_autograd::{
    Edge, Engine, FutureCell, GraphTask, InputBuffer, LeafGradSink, Node, NodeRef, Variable,
};
use gradnet_core::{Error, Result};
use gradnet_tensor::{ones_like, Tensor};

use crate::container::DistAutogradContainer;
use crate::context::DistAutogradContext;
use crate::functions::SendRpcBackward;
use crate::ContextId;

// =============================================================================
// Root Validation
// =============================================================================

fn validate_roots_and_retrieve_edges(roots: &[Variable]) -> Result<(Vec<Edge>, Vec<Tensor>)> {
    if roots.is_empty() {
        return Err(Error::invalid_state("no tensors provided for gradient computation"));
    }
    let mut edges = Vec::with_capacity(roots.len());
    let mut grads = Vec::with_capacity(roots.len());
    for (i, root) in roots.iter().enumerate() {
        if !root.requires_grad() {
            return Err(Error::invalid_state(format!("requires_grad not set on root {i}")));
        }
        if root.data().numel() != 1 {
            return Err(Error::invalid_state(format!(
                "root {i} has shape {:?}; distributed backward needs scalar roots",
                root.shape()
            )));
        }
        if root.grad_fn().is_none() {
            return Err(Error::invalid_state(format!("grad_fn not set on root {i}")));
        }
        edges.push(root.gradient_edge());
        grads.push(ones_like(root.data()));
    }
    Ok((edges, grads))
}

fn new_graph_task(context: &Arc<DistAutogradContext>, retain_graph: bool) -> Arc<GraphTask> {
    let sink: Arc<dyn LeafGradSink> = Arc::clone(context) as Arc<dyn LeafGradSink>;
    Arc::new(
        GraphTask::new(retain_graph, false, 0)
            .with_leaf_sink(sink)
            .with_exit_on_error(true),
    )
}

// =============================================================================
// DistEngine
// =============================================================================

/// Runs distributed backward passes on one worker.
pub struct DistEngine {
    engine: Arc<Engine>,
    container: Arc<DistAutogradContainer>,
}

impl DistEngine {
    /// Creates a distributed engine running local work on `engine`.
    #[must_use]
    pub fn new(engine: Arc<Engine>, container: Arc<DistAutogradContainer>) -> Self {
        Self { engine, container }
    }

    /// The local engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The container whose contexts this engine serves.
    #[must_use]
    pub fn container(&self) -> &Arc<DistAutogradContainer> {
        &self.container
    }

    /// Runs the backward pass of context `context_id` from scalar `roots`.
    ///
    /// Called on the worker that started the pass. Returns once the local
    /// graph and every gradient sent to other workers has been processed,
    /// with the first error encountered anywhere attributed to the context.
    pub fn execute(&self, context_id: ContextId, roots: &[Variable], retain_graph: bool) -> Result<()> {
        self.run_pass(context_id, roots, retain_graph)
            .map_err(|e| e.in_context(context_id))
    }

    fn run_pass(&self, context_id: ContextId, roots: &[Variable], retain_graph: bool) -> Result<()> {
        let context = self.container.retrieve_context(context_id)?;
        let (edges, grads) = validate_roots_and_retrieve_edges(roots)?;

        let graph_task = new_graph_task(&context, retain_graph);
        context.set_graph_task(Arc::clone(&graph_task))?;
        let graph_root: NodeRef = Arc::new(GraphRoot::new(edges, grads));
        let inputs = InputBuffer::new(graph_root.num_inputs());

        tracing::debug!(
            context_id,
            graph_task = graph_task.id(),
            roots = roots.len(),
            retain_graph,
            "starting distributed backward pass"
        );
        let local = self
            .engine
            .execute_with_graph_task(&graph_task, graph_root, inputs)
            .and_then(|_| self.engine.wait_for(&graph_task));

        // Drained even after a local failure so no RPC outlives the pass.
        let remote = context
            .clear_and_wait_for_outstanding_rpcs(Some(graph_task.id()))
            .wait();
        context.reset_graph_task();

        match (local, remote) {
            (Err(e), _) | (Ok(_), Err(e)) => {
                tracing::error!(context_id, error = %e, "distributed backward pass failed");
                Err(e)
            }
            (Ok(_), Ok(())) => {
                tracing::debug!(context_id, "distributed backward pass finished");
                Ok(())
            }
        }
    }

    /// Runs `send` with its stashed gradients on behalf of another worker.
    ///
    /// The returned future resolves once the local graph behind `send` and
    /// every RPC it chained to have finished.
    pub fn execute_send_function_async(
        &self,
        context: &Arc<DistAutogradContext>,
        send: Arc<SendRpcBackward>,
        retain_graph: bool,
    ) -> Arc<FutureCell<()>> {
        let done = Arc::new(FutureCell::new());
        let graph_task = new_graph_task(context, retain_graph);
        let graph_task_id = graph_task.id();

        let root: NodeRef = send;
        let local = match self
            .engine
            .execute_with_graph_task(&graph_task, root, InputBuffer::new(0))
        {
            Ok(local) => local,
            Err(e) => {
                done.set_error(e);
                return done;
            }
        };

        let context = Arc::clone(context);
        let result = Arc::clone(&done);
        local.then(move |outcome| {
            let local_error = outcome.as_ref().err().cloned();
            context
                .clear_and_wait_for_outstanding_rpcs(Some(graph_task_id))
                .then(move |remote| {
                    let outcome = match (local_error, remote) {
                        (Some(e), _) => Err(e),
                        (None, Err(e)) => Err(e.clone()),
                        (None, Ok(())) => Ok(()),
                    };
                    result.complete(outcome);
                });
        });
        done
    }
}

impl std::fmt::Debug for DistEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistEngine")
            .field("worker_id", &self.container.worker_id())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
