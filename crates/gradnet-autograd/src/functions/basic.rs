//! Basic Gradient Functions - Arithmetic Operations
//!
//! Backward nodes for the arithmetic recorded by [`crate::Variable`]: add,
//! mul, scale and sum.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;

use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;
use parking_lot::Mutex;

use crate::node::{Edge, InputMetadata, Node, NodeBase};

fn single_input(node: &str, inputs: &[Option<Tensor>]) -> Result<Tensor> {
    match inputs {
        [Some(grad)] => Ok(grad.clone()),
        [None] => Err(Error::compute(node, "received an undefined gradient")),
        _ => Err(Error::structural(format!(
            "{node} expects 1 input, got {}",
            inputs.len()
        ))),
    }
}

// =============================================================================
// Add Backward
// =============================================================================

/// Gradient function for addition.
///
/// d/dx(x + y) = 1, d/dy(x + y) = 1
pub struct AddBackward {
    base: NodeBase,
}

impl AddBackward {
    /// Creates a new `AddBackward` for an output shaped like `output`.
    #[must_use]
    pub fn new(lhs: Edge, rhs: Edge, output: InputMetadata) -> Self {
        Self {
            base: NodeBase::new(vec![lhs, rhs], vec![output]),
        }
    }
}

impl Node for AddBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let grad = single_input(self.name(), &inputs)?;
        Ok(vec![Some(grad.clone()), Some(grad)])
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Mul Backward
// =============================================================================

/// Gradient function for multiplication.
///
/// d/dx(x * y) = y, d/dy(x * y) = x
///
/// The operands are saved at forward time and freed after the node runs
/// unless the graph is kept.
pub struct MulBackward {
    base: NodeBase,
    saved: Mutex<Option<(Tensor, Tensor)>>,
}

impl MulBackward {
    /// Creates a new `MulBackward` saving both operands.
    #[must_use]
    pub fn new(lhs_edge: Edge, rhs_edge: Edge, lhs: Tensor, rhs: Tensor) -> Self {
        let output = InputMetadata::from_tensor(&lhs);
        Self {
            base: NodeBase::new(vec![lhs_edge, rhs_edge], vec![output]),
            saved: Mutex::new(Some((lhs, rhs))),
        }
    }

    /// Whether the saved operands are still held.
    #[must_use]
    pub fn has_saved_tensors(&self) -> bool {
        self.saved.lock().is_some()
    }
}

impl Node for MulBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let grad = single_input(self.name(), &inputs)?;
        let saved = self.saved.lock();
        let Some((lhs, rhs)) = saved.as_ref() else {
            return Err(Error::structural(
                "trying to backward through the graph a second time, but the saved \
                 tensors of MulBackward have already been freed; pass keep_graph=true \
                 on the first pass",
            ));
        };
        let grad_lhs = grad.mul(rhs)?;
        let grad_rhs = grad.mul(lhs)?;
        Ok(vec![Some(grad_lhs), Some(grad_rhs)])
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn release_variables(&self) {
        self.saved.lock().take();
    }
}

// =============================================================================
// Scale Backward
// =============================================================================

/// Gradient function for multiplication by a constant.
pub struct ScaleBackward {
    base: NodeBase,
    factor: f32,
}

impl ScaleBackward {
    /// Creates a new `ScaleBackward`.
    #[must_use]
    pub fn new(input: Edge, factor: f32, output: InputMetadata) -> Self {
        Self {
            base: NodeBase::new(vec![input], vec![output]),
            factor,
        }
    }
}

impl Node for ScaleBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let grad = single_input(self.name(), &inputs)?;
        Ok(vec![Some(grad.mul_scalar(self.factor))])
    }

    fn name(&self) -> &'static str {
        "ScaleBackward"
    }

    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Sum Backward
// =============================================================================

/// Gradient function for summing all elements.
///
/// The scalar gradient is broadcast back to the input shape.
pub struct SumBackward {
    base: NodeBase,
    input_shape: Vec<usize>,
}

impl SumBackward {
    /// Creates a new `SumBackward` for an input of shape `input_shape`.
    #[must_use]
    pub fn new(input: Edge, input_shape: Vec<usize>, output: InputMetadata) -> Self {
        Self {
            base: NodeBase::new(vec![input], vec![output]),
            input_shape,
        }
    }
}

impl Node for SumBackward {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let grad = single_input(self.name(), &inputs)?;
        Ok(vec![Some(grad.expand(&self.input_shape)?)])
    }

    fn name(&self) -> &'static str {
        "SumBackward"
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
