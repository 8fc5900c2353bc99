//! Shape Utilities
//!
//! Helpers for reasoning about tensor dimensions.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

// =============================================================================
// Shape Utilities
// =============================================================================

/// Computes the total number of elements from a shape.
///
/// A 0-dimensional shape has one element.
#[must_use]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Formats a shape the way error messages print it, e.g. `[2, 3]`.
#[must_use]
pub fn format_shape(shape: &[usize]) -> String {
    format!("{shape:?}")
}

// =============================================================================
// Tests
// =============================================================================
