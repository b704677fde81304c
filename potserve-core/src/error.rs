// MIT License
// Copyright 2023--present potserve developers

//! Error types for the server, the wire codec and potential handlers.
//!
//! The enums mirror how far a failure is allowed to propagate:
//!
//! - [`ServerError`] ends [`Server::serve`](crate::net::Server::serve).
//!   Only bind failures, a failed *initial* handler load and unexpected
//!   accept errors end up here.
//! - [`ConnectionError`] closes one connection. The accept loop logs it and
//!   carries on with the next client.
//! - [`ReloadError`] is logged and discarded at reload time; the previous
//!   handler stays active.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::status::potserve_status_t;

/// Frame-level violations detected by the wire codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The 4-byte width tag is neither 4 nor 8.
    #[error("malformed header: integer width tag {0} is not 4 or 8")]
    MalformedHeader(i32),

    /// `n_atoms` outside `1..=max_atoms`.
    #[error("invalid atom count {n_atoms} (accepted range 1..={max_atoms})")]
    InvalidAtomCount { n_atoms: i64, max_atoms: usize },

    /// Fewer bytes than the declared layout requires.
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// An integer does not fit the chosen wire width.
    #[error("integer {value} does not fit in {width} bytes")]
    IntegerOverflow { value: i64, width: usize },

    /// Per-atom arrays of a request disagree in length.
    #[error("{field} has {actual} rows, expected {expected}")]
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The handler produced a different number of force rows than atoms.
    #[error("handler returned {actual} force rows for {expected} atoms")]
    ForceCountMismatch { expected: usize, actual: usize },
}

/// Failure raised by a potential handler while computing.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Compute(String),

    /// A C callback returned a non-success status.
    #[error("potential callback returned {status:?}: {message}")]
    Callback {
        status: potserve_status_t,
        message: String,
    },

    /// The handler returned data that violates its output contract.
    #[error("invalid handler output: {0}")]
    InvalidOutput(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Failure to resolve a handler from its source.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("no handler source configured")]
    NoSource,

    #[error("failed to read model file '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model file '{path}': {source}", path = path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown potential kind '{0}'")]
    UnknownPotential(String),

    #[error("invalid parameters for '{kind}': {message}")]
    InvalidParameters { kind: String, message: String },
}

/// Anything that closes a single client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("socket operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// Errors that terminate the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server must be started before it can run")]
    NotStarted,

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to load initial handler: {0}")]
    InitialLoad(#[from] ReloadError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors seen by the client side of the protocol.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("server closed the connection")]
    Closed,
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
