//! Gradnet Tensor - Gradient Values for the Autograd Engine
//!
//! This crate provides the `Tensor` type carried along graph edges during a
//! backward pass and across the wire between workers. It is deliberately
//! small: a dense `f32` buffer with a shape and a device, elementwise
//! accumulation, zero synthesis and `serde` support for the RPC codec.
//!
//! # Example
//! ```rust
//! use gradnet_tensor::{ones, zeros, Tensor};
//!
//! let a = zeros(&[2, 3]);
//! let b = ones(&[2, 3]);
//! let c = a.add(&b).unwrap();
//! assert_eq!(c.sum().item().unwrap(), 6.0);
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
#![allow(clippy::float_cmp)]

// =============================================================================
// Modules
// =============================================================================

pub mod creation;
pub mod shape;
pub mod tensor;

// =============================================================================
// Re-exports
// =============================================================================

pub use creation::*;
pub use gradnet_core::{Device, Error, Result};
pub use tensor::Tensor;

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::tensor::Tensor;
    pub use crate::{full, ones, ones_like, zeros, zeros_like, zeros_on};
    pub use gradnet_core::{Device, Error, Result};
}
