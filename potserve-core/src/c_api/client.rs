// MIT License
// Copyright 2023--present potserve developers

//! C API for the blocking client.
//!
//! Lets a C/C++ simulation code request energies and forces from a running
//! server with the same input/output structs used by local callbacks.

use std::os::raw::c_char;

use crate::c_api::server::host_arg;
use crate::error::ClientError;
use crate::net::Client;
use crate::status::{catch_unwind, potserve_status_t, set_last_error};
use crate::tensor::{create_owned_f64_tensor, read_i64_vector, read_vec3_rows};
use crate::types::{potserve_force_input_t, potserve_force_out_t};
use crate::wire::{IntWidth, Request};

/// Opaque client handle.
pub type potserve_client_t = Client;

/// Create a client for `host:port`. The connection opens on the first
/// calculation. Returns `NULL` on failure.
///
/// # Safety
/// `host` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn potserve_client_new(host: *const c_char, port: u16) -> *mut potserve_client_t {
    let host = match unsafe { host_arg("potserve_client_new", host) } {
        Ok(h) => h,
        Err(_) => return std::ptr::null_mut(),
    };
    match Client::new(&host, port) {
        Ok(client) => Box::into_raw(Box::new(client)),
        Err(e) => {
            set_last_error(&format!("potserve_client_new: {e}"));
            std::ptr::null_mut()
        }
    }
}

/// Copy the CPU tensors of `input` into a request.
///
/// # Safety
/// All non-null tensor pointers in `input` must be valid.
unsafe fn request_from_input(input: &potserve_force_input_t) -> Result<Request, String> {
    let n = unsafe { input.n_atoms() }.ok_or("cannot determine n_atoms from positions")?;
    let numbers = unsafe { read_i64_vector(input.atomic_numbers, "atomic_numbers", n)? };
    let positions = unsafe { read_vec3_rows(input.positions, "positions", n)? };
    let request = Request::new(numbers, positions).with_int_width(IntWidth::Eight);
    if input.contributing.is_null() {
        return Ok(request);
    }
    let contributing = unsafe { read_i64_vector(input.contributing, "contributing", n)? };
    Ok(request.with_contributing(contributing))
}

/// Evaluate `input` on the server.
///
/// On success `output->forces` is a new tensor the caller frees with
/// `potserve_tensor_free`. A NULL `input->contributing` marks every atom
/// as contributing.
///
/// # Safety
/// `client` must come from `potserve_client_new`; `input` and `output` must
/// be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn potserve_client_calculate(
    client: *mut potserve_client_t,
    input: *const potserve_force_input_t,
    output: *mut potserve_force_out_t,
) -> potserve_status_t {
    catch_unwind(std::panic::AssertUnwindSafe(|| {
        if client.is_null() {
            set_last_error("potserve_client_calculate: client is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }
        if input.is_null() {
            set_last_error("potserve_client_calculate: input is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }
        if output.is_null() {
            set_last_error("potserve_client_calculate: output is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }

        let client = unsafe { &mut *client };
        let request = match unsafe { request_from_input(&*input) } {
            Ok(r) => r,
            Err(e) => {
                set_last_error(&format!("potserve_client_calculate: {e}"));
                return potserve_status_t::POTSERVE_INVALID_PARAMETER;
            }
        };

        match client.calculate(&request) {
            Ok(eval) => {
                let n = eval.forces.len() as i64;
                let flat: Vec<f64> = eval.forces.iter().flatten().copied().collect();
                let out = unsafe { &mut *output };
                out.energy = eval.energy;
                out.forces = create_owned_f64_tensor(flat, vec![n, 3]);
                potserve_status_t::POTSERVE_SUCCESS
            }
            Err(e) => {
                set_last_error(&format!("potserve_client_calculate: {e}"));
                match e {
                    ClientError::Protocol(_) => potserve_status_t::POTSERVE_PROTOCOL_ERROR,
                    _ => potserve_status_t::POTSERVE_IO_ERROR,
                }
            }
        }
    }))
}

/// Free a client handle, closing its connection. `NULL` is a no-op.
///
/// # Safety
/// `client` must be NULL or come from `potserve_client_new`.
#[no_mangle]
pub unsafe extern "C" fn potserve_client_free(client: *mut potserve_client_t) {
    if !client.is_null() {
        drop(unsafe { Box::from_raw(client) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c_api::types::{potserve_force_input_create, potserve_force_input_free};
    use std::ffi::CString;

    #[test]
    fn null_host_returns_null() {
        assert!(unsafe { potserve_client_new(std::ptr::null(), 1) }.is_null());
    }

    #[test]
    fn request_from_input_reads_all_tensors() {
        let mut numbers = [18_i64, 18];
        let mut pos = [0.0_f64, 0.0, 0.0, 3.5, 0.0, 0.0];
        let mut mask = [1_i64, 0];
        let mut input = unsafe {
            potserve_force_input_create(2, numbers.as_mut_ptr(), pos.as_mut_ptr(), mask.as_mut_ptr())
        };

        let request = unsafe { request_from_input(&input) }.unwrap();
        assert_eq!(request.atomic_numbers, vec![18, 18]);
        assert_eq!(request.positions, vec![[0.0; 3], [3.5, 0.0, 0.0]]);
        assert_eq!(request.contributing, vec![1, 0]);

        unsafe { potserve_force_input_free(&mut input) };
    }

    #[test]
    fn unreachable_server_is_io_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let host = CString::new("127.0.0.1").unwrap();
        let client = unsafe { potserve_client_new(host.as_ptr(), port) };
        assert!(!client.is_null());

        let mut numbers = [1_i64];
        let mut pos = [0.0_f64; 3];
        let mut mask = [1_i64];
        let mut input = unsafe {
            potserve_force_input_create(1, numbers.as_mut_ptr(), pos.as_mut_ptr(), mask.as_mut_ptr())
        };
        let mut output = potserve_force_out_t::default();

        let status = unsafe { potserve_client_calculate(client, &input, &mut output) };
        assert_eq!(status, potserve_status_t::POTSERVE_IO_ERROR);
        assert!(output.forces.is_null());

        unsafe {
            potserve_force_input_free(&mut input);
            potserve_client_free(client);
        }
    }
}
