// MIT License
// Copyright 2023--present potserve developers

//! Status codes and last-error reporting for the C API.
//!
//! Every `extern "C"` function returns a [`potserve_status_t`]. On failure a
//! human-readable message is stored in a thread-local slot and can be read
//! back with [`potserve_last_error()`]; the pointer stays valid until the
//! next `potserve_*` call on the same thread.
//!
//! Panics must never unwind into C, so every entry point runs its body
//! through [`catch_unwind`], which turns a caught panic into
//! `POTSERVE_INTERNAL_ERROR`.
//!
//! ```c
//! potserve_status_t s = potserve_server_start(pot, "127.0.0.1", 12345);
//! if (s != POTSERVE_SUCCESS) {
//!     fprintf(stderr, "potserve: %s\n", potserve_last_error());
//! }
//! ```

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;

/// Status codes returned by all C API functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum potserve_status_t {
    /// Operation completed successfully.
    POTSERVE_SUCCESS = 0,
    /// An invalid parameter was passed (null pointer, wrong size, etc.).
    POTSERVE_INVALID_PARAMETER = 1,
    /// An internal error occurred (e.g. a Rust panic was caught).
    POTSERVE_INTERNAL_ERROR = 2,
    /// Socket-level failure: bind, connect, read or write.
    POTSERVE_IO_ERROR = 3,
    /// The peer violated the wire protocol.
    POTSERVE_PROTOCOL_ERROR = 4,
}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

/// Store an error message in the thread-local slot.
pub(crate) fn set_last_error(msg: &str) {
    LAST_ERROR.with(|cell| {
        let c = CString::new(msg.replace('\0', " ")).unwrap_or_default();
        *cell.borrow_mut() = c;
    });
}

/// Read the last error message of the current thread as an owned string.
pub(crate) fn last_error_message() -> String {
    LAST_ERROR.with(|cell| cell.borrow().to_string_lossy().into_owned())
}

/// Retrieve a pointer to the last error message for the current thread.
///
/// # Safety
/// Intended to be called from C. The returned pointer must not be freed and
/// is invalidated by the next `potserve_*` call on the same thread.
#[no_mangle]
pub unsafe extern "C" fn potserve_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ptr())
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Execute a closure, catching any panics and converting them to status codes.
pub(crate) fn catch_unwind<F>(f: F) -> potserve_status_t
where
    F: FnOnce() -> potserve_status_t + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(status) => status,
        Err(e) => {
            set_last_error(&panic_message(e.as_ref()));
            potserve_status_t::POTSERVE_INTERNAL_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_last_error() {
        set_last_error("test error");
        let ptr = unsafe { potserve_last_error() };
        let msg = unsafe { std::ffi::CStr::from_ptr(ptr) };
        assert_eq!(msg.to_str().unwrap(), "test error");
        assert_eq!(last_error_message(), "test error");
    }

    #[test]
    fn interior_nul_is_replaced() {
        set_last_error("bad\0byte");
        assert_eq!(last_error_message(), "bad byte");
    }

    #[test]
    fn catch_unwind_success() {
        let status = catch_unwind(|| potserve_status_t::POTSERVE_SUCCESS);
        assert_eq!(status, potserve_status_t::POTSERVE_SUCCESS);
    }

    #[test]
    fn catch_unwind_panic() {
        let status = catch_unwind(|| panic!("boom"));
        assert_eq!(status, potserve_status_t::POTSERVE_INTERNAL_ERROR);
        assert_eq!(last_error_message(), "boom");
    }
}
