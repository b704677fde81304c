// MIT License
// Copyright 2023--present potserve developers

//! Public C API entry points.
//!
//! Each submodule exposes `extern "C"` functions that cbindgen collects into
//! `potserve-core/include/potserve.h`. All functions in this module follow
//! three invariants:
//!
//! 1. **Return [`potserve_status_t`](crate::status::potserve_status_t)** (or
//!    a pointer / void for constructors and destructors).
//! 2. **Wrap the body in [`catch_unwind`](crate::status::catch_unwind)** so
//!    panics never cross the FFI boundary.
//! 3. **Validate pointer arguments** and call
//!    [`set_last_error`](crate::status::set_last_error) before returning a
//!    non-success status.
//!
//! ## Submodules
//!
//! - [`types`]: constructors for
//!   [`potserve_force_input_t`](crate::types::potserve_force_input_t) and
//!   [`potserve_force_out_t`](crate::types::potserve_force_out_t).
//! - [`potential`]: lifecycle of
//!   [`potserve_potential_t`](crate::potential::potserve_potential_t).
//! - [`server`]: serve a callback potential over the socket protocol.
//! - [`client`]: evaluate configurations on a remote server.

pub mod client;
pub mod potential;
pub mod server;
pub mod types;
