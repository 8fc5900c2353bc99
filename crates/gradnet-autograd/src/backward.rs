//! Backward Pass - User-Facing Entry Points
//!
//! `backward` accumulates gradients into graph leaves; `grad` returns the
//! gradients of outputs with respect to chosen inputs without touching the
//! leaves. Both validate their arguments and hand a single pass to the
//! engine.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use gradnet_core::{Error, Result};
use gradnet_tensor::Tensor;

use crate::engine::Engine;
use crate::node::Edge;
use crate::variable::Variable;

// =============================================================================
// Argument Handling
// =============================================================================

fn make_roots(tensors: &[Variable], grad_tensors: &[Option<Tensor>]) -> Result<(Vec<Edge>, Vec<Tensor>)> {
    if !grad_tensors.is_empty() && grad_tensors.len() != tensors.len() {
        return Err(Error::structural(format!(
            "got {} tensors and {} gradients",
            tensors.len(),
            grad_tensors.len()
        )));
    }
    let mut roots = Vec::with_capacity(tensors.len());
    let mut grads = Vec::with_capacity(tensors.len());
    for (i, tensor) in tensors.iter().enumerate() {
        let edge = tensor.gradient_edge();
        if !edge.is_valid() {
            return Err(Error::invalid_state(format!(
                "element {i} of tensors does not require grad and does not have a grad_fn"
            )));
        }
        let grad = match grad_tensors.get(i).cloned().flatten() {
            Some(grad) => grad,
            None => tensor.implicit_grad()?,
        };
        roots.push(edge);
        grads.push(grad);
    }
    Ok((roots, grads))
}

fn make_outputs(inputs: &[Variable]) -> Result<Vec<Edge>> {
    inputs
        .iter()
        .map(|input| {
            let edge = input.gradient_edge();
            if edge.is_valid() {
                Ok(edge)
            } else {
                Err(Error::invalid_state(
                    "one of the differentiated tensors does not require grad",
                ))
            }
        })
        .collect()
}

// =============================================================================
// Entry Points
// =============================================================================

/// Accumulates gradients of `tensors` into the leaves of their graphs.
///
/// `grad_tensors` may be empty or hold `None` for scalar outputs, which are
/// seeded with ones. A non-empty `inputs` restricts accumulation to those
/// variables.
pub fn backward(
    engine: &Engine,
    tensors: &[Variable],
    grad_tensors: &[Option<Tensor>],
    keep_graph: bool,
    create_graph: bool,
    inputs: &[Variable],
) -> Result<()> {
    let (roots, grads) = make_roots(tensors, grad_tensors)?;
    let outputs = make_outputs(inputs)?;
    engine.execute(&roots, grads, keep_graph, create_graph, true, &outputs)?;
    Ok(())
}

/// Returns the gradients of `outputs` with respect to `inputs`.
///
/// Leaves are not modified. An input the outputs do not depend on is an
/// error unless `allow_unused` is set, in which case its entry is `None`.
pub fn grad(
    engine: &Engine,
    outputs: &[Variable],
    inputs: &[Variable],
    grad_outputs: &[Option<Tensor>],
    keep_graph: bool,
    create_graph: bool,
    allow_unused: bool,
) -> Result<Vec<Option<Tensor>>> {
    if inputs.is_empty() {
        return Err(Error::invalid_state("grad requires non-empty inputs"));
    }
    let (roots, grads) = make_roots(outputs, grad_outputs)?;
    let output_edges = make_outputs(inputs)?;
    let results = engine.execute(&roots, grads, keep_graph, create_graph, false, &output_edges)?;
    if !allow_unused {
        if let Some(i) = results.iter().position(Option::is_none) {
            return Err(Error::invalid_state(format!(
                "differentiated tensor {i} appears to not have been used in the graph; \
                 set allow_unused=true if this is the desired behavior"
            )));
        }
    }
    Ok(results)
}

// =============================================================================
// Tests
// =============================================================================
