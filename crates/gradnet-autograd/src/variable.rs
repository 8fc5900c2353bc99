//! Variable - Tensor with Gradient Tracking
//!
//! A `Variable` pairs a tensor with the autograd metadata the engine needs:
//! whether it requires gradients, the node that produced it (and which of
//! that node's outputs it is), and for leaves the shared gradient cell and
//! the accumulator node pinned to it. Arithmetic on variables records
//! backward nodes while grad mode is enabled.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use gradnet_core::{Device, Error, Result};
use gradnet_tensor::{ones_like, Tensor};
use parking_lot::RwLock;

use crate::backward;
use crate::engine::Engine;
use crate::functions::{
    AccumulateGrad, AddBackward, GradAccumulator, MulBackward, ScaleBackward, SumBackward,
};
use crate::no_grad::is_grad_enabled;
use crate::node::{Edge, InputMetadata, NodeRef};

/// Process-unique identity of a variable.
pub type VariableId = u64;

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

struct VariableInner {
    id: VariableId,
    data: Tensor,
    requires_grad: bool,
    grad_fn: Option<NodeRef>,
    output_nr: usize,
    grad: GradAccumulator,
    grad_accumulator: OnceLock<NodeRef>,
}

// =============================================================================
// Variable Struct
// =============================================================================

/// A tensor with automatic differentiation support.
///
/// Cloning is cheap and yields a handle to the same variable.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl Variable {
    fn build(data: Tensor, requires_grad: bool, grad_fn: Option<NodeRef>, output_nr: usize) -> Self {
        Self {
            inner: Arc::new(VariableInner {
                id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
                data,
                requires_grad,
                grad_fn,
                output_nr,
                grad: Arc::new(RwLock::new(None)),
                grad_accumulator: OnceLock::new(),
            }),
        }
    }

    /// Creates a leaf variable.
    #[must_use]
    pub fn new(data: Tensor, requires_grad: bool) -> Self {
        Self::build(data, requires_grad, None, 0)
    }

    /// Creates a leaf variable that doesn't require gradients.
    #[must_use]
    pub fn from_tensor(data: Tensor) -> Self {
        Self::new(data, false)
    }

    /// Creates output `output_nr` of `grad_fn`.
    #[must_use]
    pub fn with_grad_fn(data: Tensor, grad_fn: NodeRef, output_nr: usize) -> Self {
        Self::build(data, true, Some(grad_fn), output_nr)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Identity of this variable.
    #[must_use]
    pub fn id(&self) -> VariableId {
        self.inner.id
    }

    /// The underlying tensor.
    #[must_use]
    pub fn data(&self) -> &Tensor {
        &self.inner.data
    }

    /// Shape of the underlying tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.inner.data.shape()
    }

    /// Device of the underlying tensor.
    #[must_use]
    pub fn device(&self) -> Device {
        self.inner.data.device()
    }

    /// Whether gradients flow to this variable.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Whether this variable was created by the user rather than an operation.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.inner.grad_fn.is_none()
    }

    /// Node that produced this variable.
    #[must_use]
    pub fn grad_fn(&self) -> Option<&NodeRef> {
        self.inner.grad_fn.as_ref()
    }

    /// Which output of `grad_fn` this variable is.
    #[must_use]
    pub fn output_nr(&self) -> usize {
        self.inner.output_nr
    }

    /// Accumulated gradient of a leaf.
    #[must_use]
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.grad.read().clone()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.inner.grad.write() = None;
    }

    /// Accumulator node of a leaf that requires grad.
    ///
    /// Created on first use and kept for the leaf's lifetime.
    #[must_use]
    pub fn grad_accumulator(&self) -> Option<NodeRef> {
        if !self.is_leaf() || !self.requires_grad() {
            return None;
        }
        let node = self.inner.grad_accumulator.get_or_init(|| {
            Arc::new(AccumulateGrad::new(
                self.id(),
                InputMetadata::from_tensor(&self.inner.data),
                Arc::clone(&self.inner.grad),
            ))
        });
        Some(Arc::clone(node))
    }

    /// Edge gradients for this variable flow into.
    ///
    /// Empty for variables that don't require grad.
    #[must_use]
    pub fn gradient_edge(&self) -> Edge {
        match (&self.inner.grad_fn, self.grad_accumulator()) {
            (Some(grad_fn), _) => Edge::new(Arc::clone(grad_fn), self.inner.output_nr),
            (None, Some(accumulator)) => Edge::new(accumulator, 0),
            (None, None) => Edge::empty(),
        }
    }

    /// Returns a variable sharing the data but detached from the graph.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self::new(self.inner.data.clone(), false)
    }

    // =========================================================================
    // Backward
    // =========================================================================

    /// Computes gradients of this scalar with respect to the graph leaves.
    pub fn backward(&self) -> Result<()> {
        backward::backward(Engine::get_default_engine(), &[self.clone()], &[], false, false, &[])
    }

    // =========================================================================
    // Arithmetic Operations
    // =========================================================================

    fn records(inputs: &[&Variable]) -> bool {
        is_grad_enabled() && inputs.iter().any(|v| v.requires_grad())
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Variable) -> Result<Variable> {
        let result = self.data().add(other.data())?;
        if !Self::records(&[self, other]) {
            return Ok(Self::from_tensor(result));
        }
        let node: NodeRef = Arc::new(AddBackward::new(
            self.gradient_edge(),
            other.gradient_edge(),
            InputMetadata::from_tensor(&result),
        ));
        Ok(Self::with_grad_fn(result, node, 0))
    }

    /// Element-wise multiplication.
    pub fn mul(&self, other: &Variable) -> Result<Variable> {
        let result = self.data().mul(other.data())?;
        if !Self::records(&[self, other]) {
            return Ok(Self::from_tensor(result));
        }
        let node: NodeRef = Arc::new(MulBackward::new(
            self.gradient_edge(),
            other.gradient_edge(),
            self.data().clone(),
            other.data().clone(),
        ));
        Ok(Self::with_grad_fn(result, node, 0))
    }

    /// Multiplies by a constant.
    #[must_use]
    pub fn mul_scalar(&self, factor: f32) -> Variable {
        let result = self.data().mul_scalar(factor);
        if !Self::records(&[self]) {
            return Self::from_tensor(result);
        }
        let node: NodeRef = Arc::new(ScaleBackward::new(
            self.gradient_edge(),
            factor,
            InputMetadata::from_tensor(&result),
        ));
        Self::with_grad_fn(result, node, 0)
    }

    /// Sums all elements into a scalar.
    #[must_use]
    pub fn sum(&self) -> Variable {
        let result = self.data().sum();
        if !Self::records(&[self]) {
            return Self::from_tensor(result);
        }
        let node: NodeRef = Arc::new(SumBackward::new(
            self.gradient_edge(),
            self.shape().to_vec(),
            InputMetadata::from_tensor(&result),
        ));
        Self::with_grad_fn(result, node, 0)
    }

    /// Implicit seed gradient for a scalar output.
    pub(crate) fn implicit_grad(&self) -> Result<Tensor> {
        if self.data().numel() != 1 {
            return Err(Error::invalid_state(format!(
                "grad can be implicitly created only for scalar outputs, got shape {:?}",
                self.shape()
            )));
        }
        Ok(ones_like(self.data()))
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.inner.id)
            .field("data", &self.inner.data)
            .field("requires_grad", &self.inner.requires_grad)
            .field("grad_fn", &self.inner.grad_fn.as_ref().map(|n| n.name()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::no_grad::no_grad;

    #[test]
    fn test_leaf_properties() {
        let x = Variable::new(Tensor::scalar(2.0), true);
        assert!(x.is_leaf());
        assert!(x.requires_grad());
        assert!(x.grad().is_none());
        let a = x.grad_accumulator().unwrap();
        let b = x.grad_accumulator().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(x.gradient_edge().function.unwrap().name(), "AccumulateGrad");
    }

    #[test]
    fn test_no_grad_leaf_has_empty_edge() {
        let x = Variable::from_tensor(Tensor::scalar(2.0));
        assert!(!x.gradient_edge().is_valid());
        assert!(x.grad_accumulator().is_none());
    }

    #[test]
    fn test_ops_record_nodes() {
        let x = Variable::new(Tensor::scalar(2.0), true);
        let y = x.mul_scalar(3.0).sum();
        assert!(!y.is_leaf());
        assert_eq!(y.grad_fn().unwrap().name(), "SumBackward");
        assert_eq!(y.data().item().unwrap(), 6.0);
    }

    #[test]
    fn test_no_grad_does_not_record() {
        let x = Variable::new(Tensor::scalar(2.0), true);
        let y = no_grad(|| x.mul_scalar(3.0));
        assert!(y.is_leaf());
        assert!(!y.requires_grad());
    }

    #[test]
    fn test_backward_on_default_engine() {
        let x = Variable::new(Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap(), true);
        let w = Variable::new(Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap(), true);
        let loss = x.mul(&w).unwrap().sum();
        loss.backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec(), vec![3.0, 4.0]);
        assert_eq!(w.grad().unwrap().to_vec(), vec![1.0, 2.0]);

        x.zero_grad();
        assert!(x.grad().is_none());
    }

    #[test]
    fn test_detach() {
        let x = Variable::new(Tensor::scalar(2.0), true);
        let d = x.mul_scalar(2.0).detach();
        assert!(d.is_leaf());
        assert!(!d.requires_grad());
        assert_ne!(d.id(), x.id());
    }
}
