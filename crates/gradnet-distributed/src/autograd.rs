//! Autograd - Recording RPC Boundaries and Reading Results
//!
//! Tensors that cross an RPC during the forward pass get a send node on the
//! sender and a recv node on the receiver, both registered with the pass's
//! context under the same autograd message id. After the backward pass the
//! leaf gradients of a worker are read from its context.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gradnet_autograd::{InputMetadata, NodeRef, Variable, VariableId};
use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;

use crate::container::DistAutogradContainer;
use crate::context::DistAutogradContext;
use crate::engine::DistEngine;
use crate::functions::{RecvRpcBackward, SendRpcBackward};
use crate::rpc::{AutogradMetadata, DeviceMap, RpcAgent};
use crate::{ContextId, WorkerId};

// =============================================================================
// Forward Recording
// =============================================================================

/// Attaches a send node for `tensors` sent to worker `dst`.
///
/// Returns `None` when none of the tensors require grad.
pub fn add_send_rpc_backward(
    context: &DistAutogradContext,
    metadata: AutogradMetadata,
    tensors: &[Variable],
    dst: WorkerId,
) -> Result<Option<Arc<SendRpcBackward>>> {
    if !tensors.iter().any(Variable::requires_grad) {
        return Ok(None);
    }
    let edges = tensors.iter().map(Variable::gradient_edge).collect();
    let send = Arc::new(SendRpcBackward::new(edges));
    context.add_send_function(Arc::clone(&send), metadata.message_id)?;
    context.add_known_worker_id(dst);
    tracing::debug!(
        context_id = metadata.context_id,
        message_id = metadata.message_id,
        dst,
        tensors = tensors.len(),
        "recorded send"
    );
    Ok(Some(send))
}

/// Wraps `tensors` received from `from_worker` as outputs of a new recv node.
pub fn add_recv_rpc_backward(
    context: &Arc<DistAutogradContext>,
    metadata: AutogradMetadata,
    tensors: Vec<Tensor>,
    from_worker: WorkerId,
    agent: Arc<dyn RpcAgent>,
    device_map: DeviceMap,
    timeout: Option<Duration>,
) -> Result<Vec<Variable>> {
    let input_metadata = tensors.iter().map(InputMetadata::from_tensor).collect();
    let recv = Arc::new(RecvRpcBackward::new(
        metadata,
        input_metadata,
        Arc::downgrade(context),
        from_worker,
        agent,
        device_map,
        timeout,
    ));
    context.add_recv_function(Arc::clone(&recv), metadata.message_id)?;
    context.add_known_worker_id(from_worker);

    let node: NodeRef = recv;
    Ok(tensors
        .into_iter()
        .enumerate()
        .map(|(i, tensor)| Variable::with_grad_fn(tensor, Arc::clone(&node), i))
        .collect())
}

/// Records a forward send of `tensors` to `dst` in the current context.
///
/// Returns the metadata to ship alongside the tensors, or `None` when the
/// thread has no current context or nothing requires grad.
pub fn record_send(
    container: &DistAutogradContainer,
    tensors: &[Variable],
    dst: WorkerId,
) -> Result<Option<AutogradMetadata>> {
    if !container.has_valid_context() || !tensors.iter().any(Variable::requires_grad) {
        return Ok(None);
    }
    let context = container.current_context()?;
    let metadata = AutogradMetadata::new(context.context_id(), container.new_autograd_message_id()?);
    add_send_rpc_backward(&context, metadata, tensors, dst)?;
    Ok(Some(metadata))
}

/// Records a forward receive of `tensors` from `from_worker`.
///
/// Without metadata the tensors are returned as constants.
pub fn record_recv(
    container: &DistAutogradContainer,
    metadata: Option<AutogradMetadata>,
    tensors: Vec<Tensor>,
    from_worker: WorkerId,
    device_map: DeviceMap,
) -> Result<Vec<Variable>> {
    let Some(metadata) = metadata else {
        return Ok(tensors.into_iter().map(Variable::from_tensor).collect());
    };
    let agent = container.rpc_agent().ok_or_else(|| {
        Error::invalid_state(format!(
            "worker {} has no rpc agent to send gradients back with",
            container.worker_id()
        ))
    })?;
    let context = container.get_or_create_context(metadata.context_id);
    add_recv_rpc_backward(
        &context,
        metadata,
        tensors,
        from_worker,
        agent,
        device_map,
        container.rpc_timeout(),
    )
}

// =============================================================================
// Backward and Results
// =============================================================================

/// Runs a distributed backward pass from `roots` in context `context_id`.
pub fn backward(
    engine: &DistEngine,
    context_id: ContextId,
    roots: &[Variable],
    retain_graph: bool,
) -> Result<()> {
    engine.execute(context_id, roots, retain_graph)
}

/// Leaf gradients collected on this worker for context `context_id`.
pub fn get_gradients(
    container: &DistAutogradContainer,
    context_id: ContextId,
) -> Result<HashMap<VariableId, Tensor>> {
    Ok(container.retrieve_context(context_id)?.get_gradients())
}

// =============================================================================
// Tests
// =============================================================================
