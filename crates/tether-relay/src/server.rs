//! A single bound relay listener.
//!
//! # Lifecycle
//!
//! ```text
//! RelayServer::new(config, events)
//!       |
//!       v
//! RelayServer::start() --> RelayHandle
//!       |                       |
//!       v                       |
//! Accept loop, one task         |
//! per connection                |
//!       |                       v
//!       |               RelayHandle::shutdown()
//!       |                       |
//!       v                       v
//! Listener closed, live connections aborted
//! ```

use crate::connection::ConnectionSet;
use crate::{http, socks_session, EventBus, Protocol, RelayConfig, RelayError, RelayEvent, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// State shared by every connection task of one run.
pub(crate) struct RelayContext {
    pub(crate) config: RelayConfig,
    pub(crate) events: EventBus,
}

/// Handle for controlling a running relay listener.
pub struct RelayHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the accept loop.
    join_handle: Option<tokio::task::JoinHandle<()>>,

    /// Actual bound address.
    local_addr: SocketAddr,

    /// Effective configuration (listen port resolved).
    config: RelayConfig,

    connections: Arc<ConnectionSet>,
}

impl RelayHandle {
    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Configuration the listener actually runs with. `listen_port` is the
    /// bound port even when `0` was requested.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Number of client connections currently alive.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close the listener and abort every live connection.
    ///
    /// When this returns the listening port has been released.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = match self.shutdown_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        if let Some(handle) = self.join_handle.take() {
            if !signal_sent {
                handle.abort();
            }
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "Relay accept loop panicked"),
                Err(_) => warn!("Relay accept loop did not stop within 2s"),
            }
        }

        let closed = self.connections.close_all();
        debug!(addr = %self.local_addr, closed, "Relay listener shut down");
        Ok(())
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
            self.connections.close_all();
        }
    }
}

/// Relay listener for one configuration.
pub struct RelayServer {
    config: RelayConfig,
    events: EventBus,
}

impl RelayServer {
    pub fn new(config: RelayConfig, events: EventBus) -> Self {
        Self { config, events }
    }

    /// Bind the listener and start accepting.
    ///
    /// # Errors
    /// * `RelayError::Bind` - If the listen port cannot be bound (e.g. in use)
    pub async fn start(self) -> Result<RelayHandle> {
        let requested = self.config.listen_addr();
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|e| RelayError::Bind {
                addr: requested,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| RelayError::Bind {
            addr: requested,
            source: e,
        })?;

        let config = RelayConfig {
            listen_port: local_addr.port(),
            ..self.config
        };
        let ctx = Arc::new(RelayContext {
            config,
            events: self.events,
        });
        let connections = Arc::new(ConnectionSet::new());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_ctx = Arc::clone(&ctx);
        let accept_connections = Arc::clone(&connections);
        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = accept_loop(listener, accept_ctx, accept_connections) => {}
                _ = shutdown_rx => {}
            }
        });

        info!(
            addr = %local_addr,
            protocol = %config.protocol,
            tunnel = %config.tunnel_addr(),
            "Relay listening"
        );

        Ok(RelayHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            config,
            connections,
        })
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<RelayContext>, connections: Arc<ConnectionSet>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                stream.set_nodelay(true).ok();
                let ctx = Arc::clone(&ctx);
                connections.spawn(async move {
                    if let Err(e) = serve(stream, &ctx).await {
                        debug!(client = %peer, error = %e, "Relay connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept relay connection");
                ctx.events.publish(RelayEvent::Error {
                    message: format!("accept failed: {e}"),
                });
            }
        }
    }
}

async fn serve(stream: TcpStream, ctx: &RelayContext) -> Result<()> {
    match ctx.config.protocol {
        Protocol::Socks5 => socks_session::handle_connection(stream, ctx).await,
        Protocol::Http => http::handle_connection(stream, ctx).await,
    }
}
