// MIT License
// Copyright 2023--present potserve developers

//! C-compatible data exchange types for potential callbacks.
//!
//! ## Memory Model
//!
//! - **Input tensors** are *borrowed*: the caller keeps ownership.
//! - **Output forces** are *callee-allocated*: the callback sets
//!   `output.forces` to a tensor it creates (usually via
//!   `potserve_tensor_owned_cpu_f64_2d`); the caller frees it afterwards.
//! - **Energy** is a plain `f64` on the host.
//!
//! ## DLPack Tensor Shapes
//!
//! | Field | dtype | ndim | shape |
//! |-------|-------|------|-------|
//! | `atomic_numbers` | i64 | 1 | `[n_atoms]` |
//! | `positions` | f64 | 2 | `[n_atoms, 3]` |
//! | `contributing` | i64 | 1 | `[n_atoms]` |
//! | `forces` | f64 | 2 | `[n_atoms, 3]` |

use dlpk::sys::DLManagedTensorVersioned;

/// Input configuration for a potential energy evaluation.
#[repr(C)]
pub struct potserve_force_input_t {
    /// Atomic numbers: `[n_atoms]`, i64.
    pub atomic_numbers: *mut DLManagedTensorVersioned,
    /// Positions: `[n_atoms, 3]`, f64.
    pub positions: *mut DLManagedTensorVersioned,
    /// Contributing mask: `[n_atoms]`, i64, 0 or 1.
    pub contributing: *mut DLManagedTensorVersioned,
}

/// Results of a potential energy evaluation.
///
/// `forces` starts as `NULL` and is set by the callback.
#[repr(C)]
pub struct potserve_force_out_t {
    /// Forces tensor `[n_atoms, 3]`, f64.
    pub forces: *mut DLManagedTensorVersioned,
    /// Energy of the contributing atoms.
    pub energy: f64,
}

impl potserve_force_input_t {
    /// Extract `n_atoms` from the positions tensor's `shape[0]`.
    ///
    /// Returns `None` if `positions` is null or has no shape.
    ///
    /// # Safety
    /// The `positions` tensor must be null or a valid DLPack tensor.
    pub unsafe fn n_atoms(&self) -> Option<usize> {
        if self.positions.is_null() {
            return None;
        }
        let t = unsafe { &(*self.positions).dl_tensor };
        if t.ndim < 1 || t.shape.is_null() {
            return None;
        }
        Some(unsafe { *t.shape } as usize)
    }
}

impl Default for potserve_force_out_t {
    fn default() -> Self {
        Self {
            forces: std::ptr::null_mut(),
            energy: 0.0,
        }
    }
}
