// MIT License
// Copyright 2023--present potserve developers

//! Convenience constructors for the core C types.
//!
//! The struct definitions live in [`crate::types`]. These factory functions
//! let C callers build them without creating DLPack tensors by hand.
//!
//! `potserve_force_input_create` wraps the caller's arrays in non-owning
//! tensors; release them with `potserve_force_input_free`.

use crate::tensor::{potserve_tensor_cpu_f64_2d, potserve_tensor_cpu_i64_1d, potserve_tensor_free};
use crate::types::{potserve_force_input_t, potserve_force_out_t};

/// Create a `potserve_force_input_t` from raw CPU arrays.
///
/// Does not copy: the arrays must outlive the returned struct.
/// `potserve_force_input_free` releases the tensor metadata only.
///
/// # Safety
/// `atomic_numbers` and `contributing` must point to at least `n_atoms`
/// values, `positions` to at least `n_atoms * 3`.
#[no_mangle]
pub unsafe extern "C" fn potserve_force_input_create(
    n_atoms: usize,
    atomic_numbers: *mut i64,
    positions: *mut f64,
    contributing: *mut i64,
) -> potserve_force_input_t {
    let n = n_atoms as i64;
    potserve_force_input_t {
        atomic_numbers: unsafe { potserve_tensor_cpu_i64_1d(atomic_numbers, n) },
        positions: unsafe { potserve_tensor_cpu_f64_2d(positions, n, 3) },
        contributing: unsafe { potserve_tensor_cpu_i64_1d(contributing, n) },
    }
}

/// Free the tensor wrappers created by `potserve_force_input_create` and
/// null the pointers. The underlying arrays are left alone. `NULL` is a
/// no-op.
///
/// # Safety
/// `input` must be NULL or point to a struct from
/// `potserve_force_input_create`.
#[no_mangle]
pub unsafe extern "C" fn potserve_force_input_free(input: *mut potserve_force_input_t) {
    if input.is_null() {
        return;
    }
    let inp = unsafe { &mut *input };
    unsafe {
        potserve_tensor_free(inp.atomic_numbers);
        potserve_tensor_free(inp.positions);
        potserve_tensor_free(inp.contributing);
    }
    inp.atomic_numbers = std::ptr::null_mut();
    inp.positions = std::ptr::null_mut();
    inp.contributing = std::ptr::null_mut();
}

/// An empty result: `forces` is NULL until a callback or the client sets it.
#[no_mangle]
pub extern "C" fn potserve_force_out_create() -> potserve_force_out_t {
    potserve_force_out_t::default()
}
