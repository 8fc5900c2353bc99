//! Tensor - Dense Gradient Values
//!
//! The `Tensor` struct is the value type that flows along graph edges during
//! a backward pass. It carries a dense `f32` buffer, a shape and a device
//! placement. Only the operations the engine and the boundary nodes need
//! are provided: elementwise accumulation, zero synthesis, device moves and
//! a handful of arithmetic helpers used by backward formulas.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;

use gradnet_core::error::{Error, Result};
use gradnet_core::Device;
use serde::{Deserialize, Serialize};

use crate::shape::numel;

// =============================================================================
// Tensor Struct
// =============================================================================

/// A dense, row-major array of `f32` values placed on a device.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    device: Device,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Creates a new CPU tensor from a vector with the given shape.
    ///
    /// # Returns
    /// New tensor, or error if shape doesn't match data length.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        if numel(shape) != data.len() {
            return Err(Error::shape_mismatch(&[data.len()], shape));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            device: Device::Cpu,
        })
    }

    /// Creates a scalar tensor (0-dimensional).
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
            device: Device::Cpu,
        }
    }

    /// Creates a tensor filled with `value` on `device`.
    #[must_use]
    pub fn full_on(shape: &[usize], value: f32, device: Device) -> Self {
        Self {
            data: vec![value; numel(shape)],
            shape: shape.to_vec(),
            device,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Returns the shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the device this tensor is placed on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns true for a 0-dimensional or single-element tensor.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    /// Returns the underlying data.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Copies the data out into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    /// Returns the single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.data.len() == 1 {
            Ok(self.data[0])
        } else {
            Err(Error::shape_mismatch(&[], &self.shape))
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Returns a copy of this tensor placed on `device`.
    #[must_use]
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            data: self.data.clone(),
            shape: self.shape.clone(),
            device,
        }
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::shape_mismatch(&self.shape, &other.shape));
        }
        if self.device != other.device {
            return Err(Error::DeviceMismatch {
                expected: self.device,
                actual: other.device,
            });
        }
        Ok(())
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        self.check_compatible(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Self {
            data,
            shape: self.shape.clone(),
            device: self.device,
        })
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
            device: self.device,
        }
    }

    /// Elementwise addition. Shapes and devices must match.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Elementwise multiplication. Shapes and devices must match.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Multiplies every element by `factor`.
    #[must_use]
    pub fn mul_scalar(&self, factor: f32) -> Self {
        self.map(|v| v * factor)
    }

    /// Negates every element.
    #[must_use]
    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    /// Sums all elements into a scalar tensor on the same device.
    #[must_use]
    pub fn sum(&self) -> Self {
        Self {
            data: vec![self.data.iter().sum()],
            shape: Vec::new(),
            device: self.device,
        }
    }

    /// Broadcasts a one-element tensor to `shape`.
    pub fn expand(&self, shape: &[usize]) -> Result<Self> {
        let value = self.item()?;
        Ok(Self::full_on(shape, value, self.device))
    }

    /// Returns true if all elements are within `tol` of `other`'s.
    #[must_use]
    pub fn allclose(&self, other: &Self, tol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device)
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor({:?}, shape={:?}", self.data, self.shape)?;
        if !self.device.is_cpu() {
            write!(f, ", device={}", self.device)?;
        }
        write!(f, ")")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_shape() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).is_ok());
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).is_err());
    }

    #[test]
    fn test_add_and_mul() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap();
        assert_eq!(a.add(&b).unwrap().to_vec(), vec![4.0, 6.0]);
        assert_eq!(a.mul(&b).unwrap().to_vec(), vec![3.0, 8.0]);
    }

    #[test]
    fn test_add_rejects_mismatch() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let b = Tensor::from_vec(vec![1.0], &[1]).unwrap();
        assert!(matches!(a.add(&b), Err(Error::ShapeMismatch { .. })));

        let c = a.to_device(Device::Cuda(0));
        assert!(matches!(a.add(&c), Err(Error::DeviceMismatch { .. })));
    }

    #[test]
    fn test_sum_and_expand() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let s = a.sum();
        assert_eq!(s.item().unwrap(), 6.0);
        assert_eq!(s.expand(&[2]).unwrap().to_vec(), vec![6.0, 6.0]);
    }

    #[test]
    fn test_wire_encoding_keeps_device() {
        let a = Tensor::from_vec(vec![0.5, -1.5], &[2])
            .unwrap()
            .to_device(Device::Cuda(1));
        let bytes = bincode::serialize(&a).unwrap();
        let b: Tensor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(a, b);
    }
}
