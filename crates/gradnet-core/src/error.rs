//! Error Types - Gradnet Core Error Handling
//!
//! Provides the unified error type for the autograd engine and the
//! distributed autograd layer. Every failure a backward pass can observe is
//! one of four kinds: structural, invalid state, compute, or remote.
//!
//! # Key Features
//! - Unified error type shared by engine, contexts and RPC boundary nodes
//! - `Clone` so one failure can be handed to several waiters
//! - Classification into [`ErrorKind`] for propagation policy decisions
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use thiserror::Error;

use crate::device::Device;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for gradnet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed graph: bad edge, input count mismatch, id exhaustion.
    #[error("Structural error: {message}")]
    Structural {
        /// Description of the structural problem.
        message: String,
    },

    /// Operation is not valid in the current state.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the invalid state.
        message: String,
    },

    /// A distributed autograd context was released while still in use.
    #[error(
        "Autograd context {context_id} no longer valid! This usually means the autograd \
         context was cleaned up by a different thread due to an error before \
         RecvRpcBackward had a chance to run"
    )]
    ContextNoLongerValid {
        /// The released context id.
        context_id: i64,
    },

    /// A node raised while computing gradients.
    #[error("Error in {node}: {message}")]
    Compute {
        /// Name of the failing node.
        node: String,
        /// Description of the failure.
        message: String,
    },

    /// A remote worker reported a failure.
    #[error("Error on worker {worker_id}: {message}")]
    Remote {
        /// The worker that failed.
        worker_id: u16,
        /// Description of the remote failure.
        message: String,
    },

    /// An RPC did not complete within its deadline.
    #[error("RPC to worker {worker_id} timed out after {timeout_ms} ms")]
    Timeout {
        /// The destination worker.
        worker_id: u16,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The graph task was cancelled by an external stop request.
    #[error("Backward pass was cancelled")]
    Cancelled,

    /// Shape mismatch between tensors.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        actual: Vec<usize>,
    },

    /// Device mismatch between tensors.
    #[error("Device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        /// The expected device.
        expected: Device,
        /// The actual device.
        actual: Device,
    },

    /// A distributed backward pass failed with `source`.
    #[error("Distributed backward pass for context {context_id} failed: {source}")]
    DistributedPass {
        /// The pass's context id.
        context_id: i64,
        /// First error the pass hit.
        source: Box<Error>,
    },

    /// Wire encoding or decoding failed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
    },
}

// =============================================================================
// Error Kind
// =============================================================================

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Always fatal to the pass, never retried.
    Structural,
    /// Fatal to the local pass, surfaced to the caller.
    InvalidState,
    /// Aborts the owning graph task.
    Compute,
    /// Failure on the other side of an RPC.
    Remote,
}

// =============================================================================
// Result Type
// =============================================================================

/// A specialized Result type for gradnet operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Helper Functions
// =============================================================================

impl Error {
    /// Creates a new structural error.
    #[must_use]
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
        }
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a new compute error attributed to `node`.
    #[must_use]
    pub fn compute(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compute {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Creates a new remote error attributed to `worker_id`.
    #[must_use]
    pub fn remote(worker_id: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            worker_id,
            message: message.into(),
        }
    }

    /// Creates a new shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Structural { .. } => ErrorKind::Structural,
            Self::InvalidState { .. } | Self::ContextNoLongerValid { .. } | Self::Cancelled => {
                ErrorKind::InvalidState
            }
            Self::Compute { .. }
            | Self::ShapeMismatch { .. }
            | Self::DeviceMismatch { .. }
            | Self::Serialization { .. } => ErrorKind::Compute,
            Self::Remote { .. } | Self::Timeout { .. } => ErrorKind::Remote,
            Self::DistributedPass { source, .. } => source.kind(),
        }
    }

    /// Attributes a failure to distributed pass `context_id`.
    ///
    /// An error already attributed to a pass is returned unchanged.
    #[must_use]
    pub fn in_context(self, context_id: i64) -> Self {
        match self {
            Self::DistributedPass { .. } => self,
            other => Self::DistributedPass {
                context_id,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through pass attribution.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::DistributedPass { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Attributes a tensor-level failure to the node that produced it.
    ///
    /// Errors that already carry an origin are returned unchanged.
    #[must_use]
    pub fn in_node(self, node: &str) -> Self {
        match self {
            Self::ShapeMismatch { .. } | Self::DeviceMismatch { .. } => {
                Self::compute(node, self.to_string())
            }
            other => other,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
