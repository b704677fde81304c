// MIT License
// Copyright 2023--present potserve developers

//! Simulation-driver side of the protocol.
//!
//! [`Connection`] is the async client. [`Client`] wraps it with its own
//! current-thread runtime so that blocking callers, the C API included, can
//! use it without an executor. It connects lazily and reconnects after a
//! failed call, since the server closes the connection on any error.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::error::ClientError;
use crate::potential::Evaluation;
use crate::wire::{self, Request};

/// One open connection to a server.
pub struct Connection {
    stream: TcpStream,
    addr: String,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected");
        Ok(Self {
            stream,
            addr: addr.to_string(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its response.
    pub async fn calculate(&mut self, request: &Request) -> Result<Evaluation, ClientError> {
        let frame = wire::encode_request(request)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let n_atoms = request.n_atoms();
        let mut response = vec![0u8; wire::response_len(n_atoms)];
        match self.stream.read_exact(&mut response).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(ClientError::Closed),
            Err(e) => return Err(e.into()),
        }
        Ok(wire::decode_response(&response, n_atoms)?)
    }
}

/// Blocking client that owns its runtime.
pub struct Client {
    runtime: Runtime,
    addr: String,
    timeout: Option<Duration>,
    conn: Option<Connection>,
}

impl Client {
    /// Client for `host:port`. The connection is opened on the first call.
    pub fn new(host: &str, port: u16) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            addr: format!("{host}:{port}"),
            timeout: None,
            conn: None,
        })
    }

    /// Bound every call; an expired call drops the connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn calculate(&mut self, request: &Request) -> Result<Evaluation, ClientError> {
        let Self {
            runtime,
            addr,
            timeout,
            conn,
        } = self;
        let result = runtime.block_on(async {
            let call = async {
                if conn.is_none() {
                    *conn = Some(Connection::connect(addr).await?);
                }
                let live = conn.as_mut().ok_or(ClientError::Closed)?;
                let evaluation = live.calculate(request).await?;
                Ok::<Evaluation, ClientError>(evaluation)
            };
            match *timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(ClientError::Transport(std::io::Error::new(
                        ErrorKind::TimedOut,
                        format!("no response within {limit:?}"),
                    )))
                }),
                None => call.await,
            }
        });
        if result.is_err() {
            *conn = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_refused_is_reported_with_address() {
        // Bind then drop to find a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = Client::new("127.0.0.1", port).unwrap();
        let request = Request::new(vec![1], vec![[0.0; 3]]);
        match client.calculate(&request) {
            Err(ClientError::Connect { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{port}")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn server_closing_early_is_closed_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut tag = [0u8; 4];
            sock.read_exact(&mut tag).await.unwrap();
        });

        let mut conn = Connection::connect(&addr).await.unwrap();
        let request = Request::new(vec![1], vec![[0.0; 3]]);
        let result = conn.calculate(&request).await;
        server.await.unwrap();
        assert!(matches!(result, Err(ClientError::Closed) | Err(ClientError::Transport(_))));
    }
}
