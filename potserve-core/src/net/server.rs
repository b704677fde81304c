// MIT License
// Copyright 2023--present potserve developers

//! The accept loop.
//!
//! Connections are served one at a time on a current-thread runtime. The
//! loop wakes up at least every `poll_interval` so that reload and shutdown
//! requests are noticed even while no client is connected.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::control::{spawn_interrupt_listener, ActiveHandler, ControlHandle};
use crate::error::{ConnectionError, Result, ServerError};
use crate::net::connection::{handle_connection, ConnectionLimits};
use crate::potential::SharedPotential;
use crate::registry::{HandlerSource, ModelFile};

pub struct Server {
    config: ServerConfig,
    active: ActiveHandler,
    control: ControlHandle,
    listener: Option<TcpListener>,
}

impl Server {
    /// Serve a fixed handler. Reload requests are logged and ignored.
    pub fn new(config: ServerConfig, handler: SharedPotential) -> Self {
        Self::with_active(config, ActiveHandler::new(handler))
    }

    /// Serve `handler`, reloading from `source` on request.
    pub fn with_source(config: ServerConfig, handler: SharedPotential, source: Arc<dyn HandlerSource>) -> Self {
        Self::with_active(config, ActiveHandler::with_source(handler, source))
    }

    /// Load the initial handler from `source`.
    pub fn from_source(config: ServerConfig, source: Arc<dyn HandlerSource>) -> Result<Self> {
        Ok(Self::with_active(config, ActiveHandler::load(source)?))
    }

    /// Load the initial handler from the configured model file.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ServerError::Config("no model file configured".into()))?;
        Self::from_source(config, Arc::new(ModelFile::new(model)))
    }

    fn with_active(config: ServerConfig, active: ActiveHandler) -> Self {
        let control = ControlHandle::new(config.debounce_window());
        Self {
            config,
            active,
            control,
            listener: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle for requesting reloads and shutdown from elsewhere.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn active_handler(&self) -> SharedPotential {
        self.active.current()
    }

    /// Reload the handler now, independent of any pending request.
    pub fn apply_reload(&mut self) -> bool {
        self.control.take_reload();
        self.active.apply_reload()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind and listen. Calling it again while listening is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let addr = self.config.address();
        let bind_err = |source: std::io::Error| ServerError::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| bind_err(std::io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved")))?;

        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(self.config.reuse_address).map_err(bind_err)?;
        socket.bind(resolved).map_err(bind_err)?;
        let listener = socket.listen(self.config.max_connections).map_err(bind_err)?;

        let local = listener.local_addr()?;
        self.listener = Some(listener);
        self.control.set_listening(true);
        info!(
            addr = %local,
            handler = self.active.current().name(),
            "listening"
        );
        Ok(local)
    }

    /// Accept and serve connections until shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.as_ref().ok_or(ServerError::NotStarted)?;
        let limits = ConnectionLimits::from(&self.config);
        let poll = self.config.poll_interval();

        while !self.control.is_shutdown_requested() {
            self.active.apply_pending(&self.control);

            let accepted = tokio::select! {
                _ = self.control.shutdown_requested() => break,
                res = tokio::time::timeout(poll, listener.accept()) => res,
            };
            let (mut stream, peer) = match accepted {
                Err(_) => continue,
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) if self.control.is_shutdown_requested() => {
                    debug!("accept interrupted by shutdown: {e}");
                    break;
                }
                Ok(Err(e)) if is_transient(&e) => {
                    warn!("accept failed, retrying: {e}");
                    continue;
                }
                Ok(Err(e)) => return Err(ServerError::Accept(e)),
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {e}");
            }
            info!(%peer, "client connected");
            match handle_connection(&mut stream, &mut self.active, &self.control, &limits).await {
                Ok(served) => info!(%peer, served, "client disconnected"),
                Err(ConnectionError::Handler(e)) => error!(%peer, "potential failed, closing connection: {e}"),
                Err(e) => warn!(%peer, "closing connection: {e}"),
            }
        }
        info!("shutdown requested, leaving accept loop");
        Ok(())
    }

    /// Close the listener. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.listener.take().is_some() {
            debug!("listener closed");
        }
        self.control.set_listening(false);
    }

    /// `start`, `run`, then `stop`, whatever `run` returned.
    pub async fn serve(&mut self) -> Result<()> {
        self.start().await?;
        let result = self.run().await;
        self.stop();
        result
    }

    /// Serve on a fresh current-thread runtime, blocking the calling thread.
    ///
    /// With `forward_interrupts`, Ctrl-C reloads and a double Ctrl-C shuts
    /// down. Once this returns, Ctrl-C terminates the process as usual.
    pub fn serve_blocking(&mut self, forward_interrupts: bool) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let forwarder = if forward_interrupts {
                Some(spawn_interrupt_listener(self.control())?)
            } else {
                None
            };
            let result = self.serve().await;
            drop(forwarder);
            result
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}
