//! Accumulate Grad - Leaf Gradient Sink
//!
//! The terminal node of every path that ends at a leaf variable. It adds the
//! incoming gradient into storage shared with the leaf. A leaf owns its
//! accumulator for its whole lifetime, so every graph that uses the leaf
//! routes into the same node.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;
use std::sync::Arc;

use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;
use parking_lot::RwLock;

use crate::node::{InputMetadata, Node, NodeBase};
use crate::variable::VariableId;

/// Shared gradient storage for leaf variables.
pub type GradAccumulator = Arc<RwLock<Option<Tensor>>>;

/// Gradient sink for a leaf variable.
pub struct AccumulateGrad {
    base: NodeBase,
    variable_id: VariableId,
    grad: GradAccumulator,
}

impl AccumulateGrad {
    /// Creates the sink for the leaf `variable_id` shaped like `metadata`.
    #[must_use]
    pub fn new(variable_id: VariableId, metadata: InputMetadata, grad: GradAccumulator) -> Self {
        Self {
            base: NodeBase::new(Vec::new(), vec![metadata]),
            variable_id,
            grad,
        }
    }

    /// Id of the leaf this node accumulates into.
    #[must_use]
    pub fn variable_id(&self) -> VariableId {
        self.variable_id
    }

    /// Storage shared with the leaf.
    #[must_use]
    pub fn accumulator(&self) -> &GradAccumulator {
        &self.grad
    }

    /// Adds `grad` into the shared storage.
    pub fn accumulate(&self, grad: &Tensor) -> Result<()> {
        let mut slot = self.grad.write();
        *slot = Some(match slot.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        });
        Ok(())
    }
}

impl Node for AccumulateGrad {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        if inputs.len() != 1 {
            return Err(Error::structural(format!(
                "AccumulateGrad expects 1 input, got {}",
                inputs.len()
            )));
        }
        if let Some(grad) = &inputs[0] {
            self.accumulate(grad)?;
        }
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "AccumulateGrad"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gradnet_core::Device;

    #[test]
    fn test_accumulate_grad() {
        let storage: GradAccumulator = Arc::new(RwLock::new(None));
        let acc = AccumulateGrad::new(
            7,
            InputMetadata::new(&[3], Device::Cpu),
            Arc::clone(&storage),
        );
        assert_eq!(acc.name(), "AccumulateGrad");
        assert_eq!(acc.num_outputs(), 0);
        assert_eq!(acc.variable_id(), 7);

        let grad = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        acc.apply(vec![Some(grad.clone())]).unwrap();
        acc.apply(vec![Some(grad)]).unwrap();
        assert_eq!(
            storage.read().as_ref().unwrap().to_vec(),
            vec![2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn test_accumulate_rejects_wrong_shape() {
        let storage: GradAccumulator = Arc::new(RwLock::new(Some(Tensor::scalar(1.0))));
        let acc = AccumulateGrad::new(1, InputMetadata::new(&[], Device::Cpu), storage);
        let bad = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        assert!(acc.apply(vec![Some(bad)]).is_err());
    }
}
