// MIT License
// Copyright 2023--present potserve developers

//! # potserve-core
//!
//! A socket server that lets a simulation driver send atomic configurations
//! and get back an energy and per-atom forces from a swappable potential.
//!
//! ## Wire Protocol
//!
//! Every field is little-endian. A request is
//!
//! | field | size |
//! |-------|------|
//! | `int_width` | 4 bytes, `i32`, 4 or 8 |
//! | `n_atoms` | `int_width` bytes |
//! | `atomic_numbers` | `n_atoms * int_width` bytes |
//! | `positions` | `n_atoms * 24` bytes, `f64` triples |
//! | `contributing` | `n_atoms * int_width` bytes, 0 or 1 |
//!
//! and the response is one `f64` energy followed by `n_atoms * 24` bytes of
//! forces. See [`wire`].
//!
//! ## Serving
//!
//! ```no_run
//! use std::sync::Arc;
//! use potserve_core::config::ServerConfig;
//! use potserve_core::net::Server;
//! use potserve_core::registry::ModelFile;
//!
//! let config = ServerConfig { port: 31415, ..Default::default() };
//! let mut server = Server::from_source(config, Arc::new(ModelFile::new("lj.toml")))?;
//! server.serve_blocking(true)?;
//! # Ok::<(), potserve_core::error::ServerError>(())
//! ```
//!
//! Ctrl-C re-reads the model file and swaps the potential; a second Ctrl-C
//! within the debounce window shuts down. See [`control`].
//!
//! ## C API
//!
//! C/C++ potentials register a callback with `potserve_potential_new` and
//! serve it with `potserve_server_start`; C/C++ simulation codes talk to a
//! server through `potserve_client_*`. Arrays cross the boundary as DLPack
//! tensors. See [`c_api`].

#![allow(non_camel_case_types)]

pub mod c_api;
pub mod config;
pub mod control;
pub mod error;
pub mod lennard_jones;
pub mod logging;
pub mod net;
pub mod potential;
pub mod registry;
pub mod status;
pub mod tensor;
pub mod types;
pub mod wire;

pub use config::ServerConfig;
pub use control::{ActiveHandler, ControlEvent, ControlHandle};
pub use error::{ClientError, ConnectionError, HandlerError, ProtocolError, ReloadError, ServerError};
pub use net::{Client, Server};
pub use potential::{Evaluation, FnPotential, ForceInput, PotentialHandler, SharedPotential};
pub use registry::{HandlerSource, ModelFile, PotentialRegistry};
pub use wire::{IntWidth, Request};
