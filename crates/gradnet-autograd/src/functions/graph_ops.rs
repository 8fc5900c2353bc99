//! Structural Nodes - Roots, Placeholders and Error Carriers
//!
//! Nodes that do no arithmetic: the synthetic root that seeds a pass, the
//! identity placeholder, nodes that fail when reached, and nodes that stand
//! in for gradients that are known to be undefined.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::any::Any;

use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;

use crate::node::{Edge, InputMetadata, Node, NodeBase};

fn undefined_outputs(count: usize) -> Vec<Option<Tensor>> {
    vec![None; count]
}

// =============================================================================
// Graph Root
// =============================================================================

/// Synthetic root whose outputs are the seed gradients of a pass.
///
/// One edge per root; `apply` ignores its inputs and emits the stored seeds.
pub struct GraphRoot {
    base: NodeBase,
    outputs: Vec<Option<Tensor>>,
}

impl GraphRoot {
    /// Creates a root feeding `outputs[i]` along `edges[i]`.
    #[must_use]
    pub fn new(edges: Vec<Edge>, outputs: Vec<Tensor>) -> Self {
        let metadata = outputs.iter().map(InputMetadata::from_tensor).collect();
        Self {
            base: NodeBase::new(edges, metadata),
            outputs: outputs.into_iter().map(Some).collect(),
        }
    }
}

impl Node for GraphRoot {
    fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Ok(self.outputs.clone())
    }

    fn name(&self) -> &'static str {
        "GraphRoot"
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
// Identity
// =============================================================================

/// Passes its inputs through unchanged.
///
/// Also serves as the placeholder edge target for requested outputs that the
/// graph cannot reach.
pub struct Identity {
    base: NodeBase,
}

impl Identity {
    /// Creates an identity node.
    #[must_use]
    pub fn new(next_edges: Vec<Edge>, input_metadata: Vec<InputMetadata>) -> Self {
        Self {
            base: NodeBase::new(next_edges, input_metadata),
        }
    }
}

impl Node for Identity {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Ok(inputs)
    }

    fn name(&self) -> &'static str {
        "Identity"
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
// Error Nodes
// =============================================================================

/// Fails with a fixed message whenever it is reached.
pub struct ErrorNode {
    base: NodeBase,
    message: String,
}

impl ErrorNode {
    /// Creates a node failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>, next_edges: Vec<Edge>) -> Self {
        Self {
            base: NodeBase::new(next_edges, vec![InputMetadata::undefined()]),
            message: message.into(),
        }
    }

    /// The message reported on failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Node for ErrorNode {
    fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Err(Error::compute(self.name(), self.message.clone()))
    }

    fn name(&self) -> &'static str {
        "Error"
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

/// Marks an operation whose derivative does not exist yet.
pub struct NotImplemented {
    inner: ErrorNode,
}

impl NotImplemented {
    /// Creates a node for the forward operation `forward_fn`.
    #[must_use]
    pub fn new(forward_fn: &str, next_edges: Vec<Edge>) -> Self {
        Self {
            inner: ErrorNode::new(
                format!("derivative for {forward_fn} is not implemented"),
                next_edges,
            ),
        }
    }
}

impl Node for NotImplemented {
    fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Err(Error::compute(self.name(), self.inner.message()))
    }

    fn name(&self) -> &'static str {
        "NotImplemented"
    }

    fn base(&self) -> &NodeBase {
        self.inner.base()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn accepts_undefined_inputs(&self) -> bool {
        true
    }
}

/// Fails only if a defined gradient actually reaches it.
///
/// Used for outputs of once-differentiable operations: a double backward
/// that never touches the node succeeds.
pub struct DelayedError {
    base: NodeBase,
    message: String,
}

impl DelayedError {
    /// Creates a node with `num_inputs` slots failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>, num_inputs: usize, next_edges: Vec<Edge>) -> Self {
        Self {
            base: NodeBase::new(next_edges, vec![InputMetadata::undefined(); num_inputs]),
            message: message.into(),
        }
    }
}

impl Node for DelayedError {
    fn apply(&self, inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        if inputs.iter().any(Option::is_some) {
            return Err(Error::compute(self.name(), self.message.clone()));
        }
        Ok(undefined_outputs(self.num_outputs()))
    }

    fn name(&self) -> &'static str {
        "DelayedError"
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
// Undefined Gradient Nodes
// =============================================================================

/// Replaces whatever gradient it receives with an undefined one.
pub struct UndefinedGrad {
    base: NodeBase,
}

impl UndefinedGrad {
    /// Creates a one-input node that forwards an undefined gradient.
    #[must_use]
    pub fn new(next_edges: Vec<Edge>) -> Self {
        Self {
            base: NodeBase::new(next_edges, vec![InputMetadata::undefined()]),
        }
    }
}

impl Node for UndefinedGrad {
    fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Ok(undefined_outputs(self.num_outputs()))
    }

    fn name(&self) -> &'static str {
        "UndefinedGrad"
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

/// Backward of [`UndefinedGrad`]; every output is undefined.
pub struct UndefinedGradBackward {
    base: NodeBase,
}

impl UndefinedGradBackward {
    /// Creates the node with one output per edge.
    #[must_use]
    pub fn new(next_edges: Vec<Edge>) -> Self {
        Self {
            base: NodeBase::new(next_edges, vec![InputMetadata::undefined()]),
        }
    }
}

impl Node for UndefinedGradBackward {
    fn apply(&self, _inputs: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        Ok(undefined_outputs(self.num_outputs()))
    }

    fn name(&self) -> &'static str {
        "UndefinedGradBackward"
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

#[cfg(test)]
mod tests {
    use super::*;
    use gradnet_core::ErrorKind;

    #[test]
    fn test_graph_root_emits_seeds() {
        let root = GraphRoot::new(
            vec![Edge::empty(), Edge::empty()],
            vec![Tensor::scalar(1.0), Tensor::scalar(2.0)],
        );
        assert_eq!(root.num_inputs(), 2);
        let out = root.apply(vec![None, None]).unwrap();
        assert_eq!(out[1].as_ref().unwrap().item().unwrap(), 2.0);
    }

    #[test]
    fn test_identity_passes_through() {
        let id = Identity::new(vec![Edge::empty()], vec![InputMetadata::undefined()]);
        let out = id.apply(vec![Some(Tensor::scalar(3.0))]).unwrap();
        assert_eq!(out[0].as_ref().unwrap().item().unwrap(), 3.0);
    }

    #[test]
    fn test_error_nodes_fail() {
        let err = ErrorNode::new("boom", vec![]).apply(vec![None]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compute);
        assert!(err.to_string().contains("boom"));

        let err = NotImplemented::new("foo", vec![]).apply(vec![None]).unwrap_err();
        assert!(err.to_string().contains("derivative for foo is not implemented"));
    }

    #[test]
    fn test_delayed_error_only_on_defined_input() {
        let node = DelayedError::new("once differentiable", 1, vec![Edge::empty()]);
        assert_eq!(node.apply(vec![None]).unwrap(), vec![None]);
        assert!(node.apply(vec![Some(Tensor::scalar(1.0))]).is_err());
    }

    #[test]
    fn test_undefined_grad_nodes() {
        let node = UndefinedGrad::new(vec![Edge::empty()]);
        assert_eq!(node.apply(vec![Some(Tensor::scalar(1.0))]).unwrap(), vec![None]);

        let node = UndefinedGradBackward::new(vec![Edge::empty(), Edge::empty()]);
        assert_eq!(node.apply(vec![None]).unwrap(), vec![None, None]);
    }
}
