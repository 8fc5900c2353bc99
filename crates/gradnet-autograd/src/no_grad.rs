//! Grad Mode - Thread-Local Graph Recording Switch
//!
//! Controls whether operations on variables record backward nodes. The
//! engine runs every node with grad mode set to the pass's `create_graph`
//! flag, so formulas evaluated during a higher-order pass build a graph of
//! their own while ordinary passes do not.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::cell::Cell;

// =============================================================================
// Thread-Local Gradient State
// =============================================================================

thread_local! {
    /// Whether graph recording is enabled for this thread.
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns whether graph recording is currently enabled.
#[must_use]
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

fn set_grad_enabled(enabled: bool) {
    GRAD_ENABLED.with(|g| g.set(enabled));
}

// =============================================================================
// Guards
// =============================================================================

/// RAII guard that sets grad mode for its scope.
///
/// The previous mode is restored on drop, so guards nest.
pub struct GradModeGuard {
    prev_state: bool,
}

impl GradModeGuard {
    /// Sets grad mode to `enabled` until the guard is dropped.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        let prev_state = is_grad_enabled();
        set_grad_enabled(enabled);
        Self { prev_state }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev_state);
    }
}

/// RAII guard that disables graph recording within its scope.
///
/// # Example
/// ```rust
/// use gradnet_autograd::{is_grad_enabled, NoGradGuard};
///
/// {
///     let _guard = NoGradGuard::new();
///     assert!(!is_grad_enabled());
/// }
/// assert!(is_grad_enabled());
/// ```
pub struct NoGradGuard {
    _inner: GradModeGuard,
}

impl NoGradGuard {
    /// Creates a new `NoGradGuard`, disabling graph recording.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _inner: GradModeGuard::new(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that enables graph recording within its scope.
pub struct EnableGradGuard {
    _inner: GradModeGuard,
}

impl EnableGradGuard {
    /// Creates a new `EnableGradGuard`, enabling graph recording.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _inner: GradModeGuard::new(true),
        }
    }
}

impl Default for EnableGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Executes a closure with graph recording disabled.
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = NoGradGuard::new();
    f()
}

/// Executes a closure with graph recording enabled.
pub fn enable_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = EnableGradGuard::new();
    f()
}

// =============================================================================
// Tests
// =============================================================================
