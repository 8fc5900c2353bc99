//! Device Abstraction - Execution Placement
//!
//! Identifies where a gradient lives and where a node executes. The engine
//! keeps one ready queue per device, so the device doubles as the routing
//! key for scheduling.
//!
//! # Example
//! ```rust
//! use gradnet_core::Device;
//!
//! let cpu = Device::Cpu;
//! assert!(cpu.is_cpu());
//! assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
//! assert_eq!(Device::default(), Device::Cpu);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Device Enum
// =============================================================================

/// Represents a compute device where gradients are placed and nodes execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    /// CPU device (always available, synchronous).
    Cpu,

    /// Accelerator device with asynchronous streams.
    Cuda(usize),
}

impl Device {
    /// Returns true if this is a CPU device.
    #[must_use]
    pub const fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu)
    }

    /// Returns true if this device executes work on asynchronous streams.
    #[must_use]
    pub const fn supports_streams(self) -> bool {
        !self.is_cpu()
    }

    /// Returns the device index for accelerators, or 0 for CPU.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Cuda(idx) => idx,
        }
    }

    /// Returns the name of this device type.
    #[must_use]
    pub const fn device_type(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda(_) => "cuda",
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
