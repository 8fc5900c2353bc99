//! Gradient Functions - Backward Graph Node Library
//!
//! Concrete [`crate::Node`] implementations: arithmetic backward formulas,
//! the leaf accumulator, and structural nodes used by the engine.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

mod accumulate_grad;
mod basic;
mod graph_ops;

pub use accumulate_grad::*;
pub use basic::*;
pub use graph_ops::*;
