//! Tensor Creation Functions
//!
//! Factory functions for the initializations the engine needs: zero
//! gradients synthesized for undefined input slots and implicit all-ones
//! seed gradients for scalar outputs.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use gradnet_core::Device;

use crate::tensor::Tensor;

// =============================================================================
// Zero and One Initialization
// =============================================================================

/// Creates a CPU tensor filled with zeros.
///
/// # Example
/// ```rust
/// use gradnet_tensor::zeros;
/// let t = zeros(&[2, 3]);
/// assert_eq!(t.numel(), 6);
/// ```
#[must_use]
pub fn zeros(shape: &[usize]) -> Tensor {
    Tensor::full_on(shape, 0.0, Device::Cpu)
}

/// Creates a CPU tensor filled with ones.
#[must_use]
pub fn ones(shape: &[usize]) -> Tensor {
    Tensor::full_on(shape, 1.0, Device::Cpu)
}

/// Creates a CPU tensor filled with a specific value.
#[must_use]
pub fn full(shape: &[usize], value: f32) -> Tensor {
    Tensor::full_on(shape, value, Device::Cpu)
}

/// Creates a zero tensor with the given shape on `device`.
#[must_use]
pub fn zeros_on(shape: &[usize], device: Device) -> Tensor {
    Tensor::full_on(shape, 0.0, device)
}

/// Creates a tensor with the same shape and device as another, filled with zeros.
#[must_use]
pub fn zeros_like(other: &Tensor) -> Tensor {
    zeros_on(other.shape(), other.device())
}

/// Creates a tensor with the same shape and device as another, filled with ones.
#[must_use]
pub fn ones_like(other: &Tensor) -> Tensor {
    Tensor::full_on(other.shape(), 1.0, other.device())
}

// =============================================================================
// Tests
// =============================================================================
