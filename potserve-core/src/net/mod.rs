// MIT License
// Copyright 2023--present potserve developers

//! Socket layer for the binary force protocol.
//!
//! ## Server
//!
//! [`Server`] owns the listening socket, the active potential and the
//! control state. [`Server::serve`] binds, runs the accept loop and hands
//! each client to [`connection::handle_connection`], which answers requests
//! until the peer disconnects. Clients are served strictly one after
//! another.
//!
//! ## Client
//!
//! [`client::Connection`] speaks the same protocol from the simulation side;
//! [`client::Client`] is its blocking wrapper, exposed to C as
//! `potserve_client_t`.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{Client, Connection};
pub use connection::ConnectionLimits;
pub use server::Server;
