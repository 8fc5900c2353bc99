//! Gradnet Autograd - Reverse-Mode Execution Engine
//!
//! Executes backward passes over dynamic computation graphs recorded during
//! the forward pass. Nodes are scheduled on per-device worker threads as
//! soon as all their input gradients are available; gradients reaching the
//! same input are accumulated with stream-aware ordering.
//!
//! # Key Features
//!
//! - **Dependency-driven scheduling** - a node runs once every edge into it
//!   has delivered
//! - **Per-device ready queues** - CPU worker pool plus one worker per
//!   accelerator
//! - **Requested outputs** - compute gradients for chosen inputs only
//! - **Reentrant backward** - nodes may start nested passes
//! - **Hooks and final callbacks** - observe or rewrite gradients in flight
//!
//! # Basic Example
//!
//! ```rust
//! use gradnet_autograd::Variable;
//! use gradnet_tensor::Tensor;
//!
//! let x = Variable::new(Tensor::scalar(3.0), true);
//! let y = x.mul(&x).unwrap().sum();
//! y.backward().unwrap();
//! assert_eq!(x.grad().unwrap().item().unwrap(), 6.0);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::fn_params_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::missing_fields_in_debug)]

// =============================================================================
// Modules
// =============================================================================

pub mod backward;
pub mod config;
pub mod engine;
pub mod functions;
pub mod future;
pub mod graph_task;
pub mod input_buffer;
pub mod no_grad;
pub mod node;
mod ready_queue;
pub mod variable;

// =============================================================================
// Re-exports
// =============================================================================

pub use backward::{backward, grad};
pub use config::EngineConfig;
pub use engine::Engine;
pub use future::FutureCell;
pub use graph_task::{
    current_graph_task, FinalCallback, GraphTask, GraphTaskFuture, GraphTaskState, LeafGradSink,
};
pub use input_buffer::{AccumulationPlan, InputBuffer};
pub use no_grad::{enable_grad, is_grad_enabled, no_grad, EnableGradGuard, GradModeGuard, NoGradGuard};
pub use node::{node_id, Edge, InputMetadata, Node, NodeBase, NodeId, NodeRef, PostHook, PreHook};
pub use variable::{Variable, VariableId};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common autograd usage.
pub mod prelude {
    pub use crate::backward::{backward, grad};
    pub use crate::engine::Engine;
    pub use crate::no_grad::{no_grad, NoGradGuard};
    pub use crate::node::{Edge, Node, NodeRef};
    pub use crate::variable::Variable;
}
