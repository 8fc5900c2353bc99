//! Future - One-Shot Completion Cell
//!
//! A condvar-backed cell completed exactly once with a value or an error.
//! Waiters block on it; callbacks registered with `then` run on the thread
//! that completes it, or immediately if it is already complete. Later
//! completions are ignored, so the first error wins.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::time::{Duration, Instant};

use gradnet_core::{Error, Result};
use parking_lot::{Condvar, Mutex};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct CellState<T> {
    value: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
}

/// One-shot completion cell shared between producer and waiters.
pub struct FutureCell<T> {
    state: Mutex<CellState<T>>,
    done: Condvar,
}

impl<T: Clone + Send + 'static> FutureCell<T> {
    /// Creates an incomplete cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                value: None,
                callbacks: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Creates a cell already completed with `value`.
    #[must_use]
    pub fn completed(value: Result<T>) -> Self {
        let cell = Self::new();
        cell.complete(value);
        cell
    }

    /// Completes the cell. Returns `false` if it was already complete.
    pub fn complete(&self, value: Result<T>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value.clone());
            self.done.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Completes the cell with an error. Returns `false` if already complete.
    pub fn set_error(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Whether a value or error has been set.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Whether the cell completed with an error.
    #[must_use]
    pub fn has_error(&self) -> bool {
        matches!(self.state.lock().value, Some(Err(_)))
    }

    /// Returns the outcome if complete, without blocking.
    #[must_use]
    pub fn try_value(&self) -> Option<Result<T>> {
        self.state.lock().value.clone()
    }

    /// Blocks until the cell completes.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = &state.value {
                return value.clone();
            }
            self.done.wait(&mut state);
        }
    }

    /// Blocks until the cell completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(value) = &state.value {
                return Some(value.clone());
            }
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return state.value.clone();
            }
        }
    }

    /// Runs `callback` with the outcome once the cell completes.
    pub fn then(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let value = {
            let mut state = self.state.lock();
            match &state.value {
                Some(value) => value.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&value);
    }
}

impl<T: Clone + Send + 'static> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for FutureCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let completed = self.state.lock().value.is_some();
        f.debug_struct("FutureCell")
            .field("completed", &completed)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
