//! Recv RPC Backward - Exit of a Local Gradient to a Remote Worker
//!
//! Recorded on the worker that received tensors in a forward RPC. It is the
//! grad_fn of those tensors; during backward it ships their gradients back
//! to the sender and returns nothing locally.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use gradnet_autograd::{current_graph_task, InputMetadata, Node, NodeBase};
use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;

use crate::context::DistAutogradContext;
use crate::rpc::{AutogradMetadata, DeviceMap, Message, PropagateGradientsReq, RpcAgent};
use crate::WorkerId;

/// Backward node standing for tensors received from another worker.
pub struct RecvRpcBackward {
    base: NodeBase,
    metadata: AutogradMetadata,
    context: Weak<DistAutogradContext>,
    from_worker: WorkerId,
    agent: Arc<dyn RpcAgent>,
    device_map: DeviceMap,
    timeout: Option<Duration>,
}

impl RecvRpcBackward {
    /// Creates a recv node for tensors described by `input_metadata`.
    ///
    /// Gradients go back to `from_worker` with `device_map` applied.
    #[must_use]
    pub fn new(
        metadata: AutogradMetadata,
        input_metadata: Vec<InputMetadata>,
        context: Weak<DistAutogradContext>,
        from_worker: WorkerId,
        agent: Arc<dyn RpcAgent>,
        device_map: DeviceMap,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            base: NodeBase::new(vec![], input_metadata),
            metadata,
            context,
            from_worker,
            agent,
            device_map,
            timeout,
        }
    }

    /// Correlation ids of the forward RPC.
    #[must_use]
    pub fn metadata(&self) -> AutogradMetadata {
        self.metadata
    }

    /// Worker the tensors came from.
    #[must_use]
    pub fn from_worker(&self) -> WorkerId {
        self.from_worker
    }
}

impl Node for RecvRpcBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let mut grads = Vec::with_capacity(inputs.len());
        for (i, grad) in inputs.into_iter().enumerate() {
            let grad = match grad {
                Some(grad) => grad,
                None => self
                    .input_metadata(i)
                    .and_then(|meta| meta.zeros_like())
                    .ok_or_else(|| {
                        Error::structural(format!("RecvRpcBackward has no metadata for input {i}"))
                    })?,
            };
            grads.push(grad);
        }

        let context = self
            .context
            .upgrade()
            .ok_or(Error::ContextNoLongerValid {
                context_id: self.metadata.context_id,
            })?;
        let graph_task = current_graph_task().or_else(|| context.retrieve_graph_task());
        let retain_graph = graph_task.as_ref().is_some_and(|task| task.keep_graph());

        tracing::debug!(
            context_id = self.metadata.context_id,
            message_id = self.metadata.message_id,
            to = self.from_worker,
            grads = grads.len(),
            "propagating gradients"
        );
        let request = Message::PropagateGradientsReq(PropagateGradientsReq {
            metadata: self.metadata,
            grads,
            retain_graph,
        });
        let future = self
            .agent
            .send(self.from_worker, request, self.timeout, &self.device_map);
        context.add_outstanding_rpc(graph_task, future);
        Ok(vec![])
    }

    fn name(&self) -> &'static str {
        "RecvRpcBackward"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn accepts_undefined_inputs(&self) -> bool {
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
