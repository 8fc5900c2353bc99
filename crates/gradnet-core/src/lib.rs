//! Gradnet Core - Foundation Layer for the Gradnet Autograd Engine
//!
//! This crate provides the abstractions shared by every other gradnet crate:
//! device placement, the stream synchronization contract the engine must
//! honour when gradients cross streams, and the unified error type.
//!
//! # Key Features
//! - Device abstraction (CPU and stream-based accelerators)
//! - Stream/event ordering with RAII current-stream guards
//! - One error type classified into structural, invalid-state, compute and
//!   remote failures
//!
//! # Example
//! ```rust
//! use gradnet_core::{current_stream, Device, Stream, StreamGuard};
//!
//! let side = Stream::new(Device::Cuda(0), 1).unwrap();
//! {
//!     let _guard = StreamGuard::new(side);
//!     assert_eq!(current_stream(Device::Cuda(0)), Some(side));
//! }
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

// =============================================================================
// Modules
// =============================================================================

pub mod device;
pub mod error;
pub mod stream;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::Device;
pub use error::{Error, ErrorKind, Result};
pub use stream::{current_stream, Event, Stream, StreamGuard};

// =============================================================================
// Prelude
// =============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::stream::{current_stream, Stream, StreamGuard};
}
