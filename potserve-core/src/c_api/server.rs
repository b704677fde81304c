// MIT License
// Copyright 2023--present potserve developers

//! Serve a C callback potential over the socket protocol.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::Server;
use crate::potential::potserve_potential_t;
use crate::status::{catch_unwind, potserve_status_t, set_last_error};

/// Read a host string argument, reporting errors under `func`.
///
/// # Safety
/// `host` must be NULL or a valid NUL-terminated string.
pub(crate) unsafe fn host_arg(func: &str, host: *const c_char) -> Result<String, potserve_status_t> {
    if host.is_null() {
        set_last_error(&format!("{func}: host is NULL"));
        return Err(potserve_status_t::POTSERVE_INVALID_PARAMETER);
    }
    match unsafe { CStr::from_ptr(host) }.to_str() {
        Ok(s) => Ok(s.to_owned()),
        Err(e) => {
            set_last_error(&format!("{func}: invalid host string: {e}"));
            Err(potserve_status_t::POTSERVE_INVALID_PARAMETER)
        }
    }
}

/// Listen on `host:port` and answer requests with `pot` until interrupted.
///
/// Blocks the calling thread. Ctrl-C requests a reload, which is a no-op
/// for a callback potential; a second Ctrl-C within two seconds returns
/// `POTSERVE_SUCCESS`.
///
/// # Safety
/// `pot` must come from `potserve_potential_new` and, together with its
/// `user_data`, stay valid until this function returns. `host` must be a
/// valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn potserve_server_start(
    pot: *const potserve_potential_t,
    host: *const c_char,
    port: u16,
) -> potserve_status_t {
    catch_unwind(std::panic::AssertUnwindSafe(|| {
        if pot.is_null() {
            set_last_error("potserve_server_start: pot is NULL");
            return potserve_status_t::POTSERVE_INVALID_PARAMETER;
        }
        let host = match unsafe { host_arg("potserve_server_start", host) } {
            Ok(h) => h,
            Err(status) => return status,
        };

        // The caller keeps ownership of the handle; the server only
        // borrows the callback.
        let handler = Arc::new(unsafe { &*pot }.borrowed());
        let config = ServerConfig {
            host,
            port,
            ..Default::default()
        };
        let mut server = Server::new(config, handler);

        match server.serve_blocking(true) {
            Ok(()) => potserve_status_t::POTSERVE_SUCCESS,
            Err(e) => {
                set_last_error(&format!("potserve_server_start: {e}"));
                match e {
                    ServerError::Config(_) => potserve_status_t::POTSERVE_INVALID_PARAMETER,
                    _ => potserve_status_t::POTSERVE_IO_ERROR,
                }
            }
        }
    }))
}
