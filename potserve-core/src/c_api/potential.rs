// MIT License
// Copyright 2023--present potserve developers

//! C API for the potential handle lifecycle: create, calculate, free.
//!
//! ```c
//! potserve_potential_t *pot = potserve_potential_new(my_callback, my_data, NULL);
//!
//! potserve_force_input_t input = potserve_force_input_create(n, numbers, pos, mask);
//! potserve_force_out_t output = potserve_force_out_create();
//!
//! if (potserve_potential_calculate(pot, &input, &output) != POTSERVE_SUCCESS) {
//!     fprintf(stderr, "%s\n", potserve_last_error());
//! }
//! potserve_tensor_free(output.forces);
//!
//! potserve_force_input_free(&input);
//! potserve_potential_free(pot);
//! ```
//!
//! The same handle can be passed to `potserve_server_start` to serve the
//! callback over the socket protocol.

use std::os::raw::c_void;

use crate::potential::{potserve_potential_t, CallbackPotential, FreeFn, PotentialCallback};
use crate::status::{catch_unwind, potserve_status_t, set_last_error};
use crate::types::{potserve_force_input_t, potserve_force_out_t};

/// Create a potential handle from a callback.
///
/// - `callback`: computes energy and forces.
/// - `user_data`: forwarded to every callback invocation.
/// - `free_fn`: optional destructor for `user_data`, run by
///   `potserve_potential_free`. Pass `NULL` to manage `user_data` yourself.
///
/// Release the handle with `potserve_potential_free`.
#[no_mangle]
pub unsafe extern "C" fn potserve_potential_new(
    callback: PotentialCallback,
    user_data: *mut c_void,
    free_fn: Option<FreeFn>,
) -> *mut potserve_potential_t {
    Box::into_raw(Box::new(CallbackPotential::new(callback, user_data, free_fn)))
}

/// Run the callback directly, without going through the server.
///
/// On success `output->forces` holds a tensor the caller must free with
/// `potserve_tensor_free`. On error call `potserve_last_error()`.
#[no_mangle]
pub unsafe extern "C" fn potserve_potential_calculate(
    pot: *const potserve_potential_t,
    input: *const potserve_force_input_t,
    output: *mut potserve_force_out_t,
) -> potserve_status_t {
    catch_unwind(std::panic::AssertUnwindSafe(|| {
        if pot.is_null() {
            set_last_error("potserve_potential_calculate: pot is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }
        if input.is_null() {
            set_last_error("potserve_potential_calculate: input is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }
        if output.is_null() {
            set_last_error("potserve_potential_calculate: output is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }

        let pot_ref = unsafe { &*pot };
        unsafe { pot_ref.calculate(input, output) }
    }))
}

/// Free a handle from `potserve_potential_new`. `NULL` is a no-op.
#[no_mangle]
pub unsafe extern "C" fn potserve_potential_free(pot: *mut potserve_potential_t) {
    if !pot.is_null() {
        drop(unsafe { Box::from_raw(pot) });
    }
}
