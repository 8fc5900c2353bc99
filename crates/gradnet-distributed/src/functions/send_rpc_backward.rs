//! Send RPC Backward - Entry of a Remote Gradient into the Local Graph
//!
//! Recorded on the worker that sent tensors in a forward RPC. Its next
//! edges lead to whatever produced those tensors locally. During backward
//! the gradients for them arrive over the wire, are stashed here, and the
//! node is run as the root of a local pass.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;

use gradnet_autograd::{Edge, Node, NodeBase};
use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;
use parking_lot::Mutex;

/// Backward node standing for tensors sent to another worker.
pub struct SendRpcBackward {
    base: NodeBase,
    grads: Mutex<Vec<Tensor>>,
}

impl SendRpcBackward {
    /// Creates a send node flowing into `next_edges`, one per sent tensor.
    #[must_use]
    pub fn new(next_edges: Vec<Edge>) -> Self {
        Self {
            base: NodeBase::new(next_edges, vec![]),
            grads: Mutex::new(Vec::new()),
        }
    }

    /// Stashes the gradients received for the sent tensors.
    pub fn set_grads(&self, grads: Vec<Tensor>) {
        *self.grads.lock() = grads;
    }

    /// Currently stashed gradients.
    #[must_use]
    pub fn grads(&self) -> Vec<Tensor> {
        self.grads.lock().clone()
    }
}

impl Node for SendRpcBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        if !inputs.is_empty() {
            return Err(Error::structural(format!(
                "SendRpcBackward takes no inputs, got {}",
                inputs.len()
            )));
        }
        let grads = self.grads.lock().clone();
        if grads.len() != self.num_outputs() {
            return Err(Error::structural(format!(
                "SendRpcBackward expected {} gradients, got {}",
                self.num_outputs(),
                grads.len()
            )));
        }
        Ok(grads.into_iter().map(Some).collect())
    }

    fn name(&self) -> &'static str {
        "SendRpcBackward"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn release_variables(&self) {
        self.grads.lock().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
