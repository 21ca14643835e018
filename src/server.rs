//! SOCKS4 server lifecycle
//!
//! `Server` owns the configuration, the transport and the session registry.
//! State moves Idle -> Listening -> Draining -> Stopped and never back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::core::SessionManager;
use crate::error::{Result, Socks4Error};
use crate::handler::SessionContext;
use crate::logger::log;
use crate::server_runner::{accept_loop, AcceptLoop};
use crate::transport::{TcpTransport, Transport};

/// Lifecycle state of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Built, not yet listening
    Idle = 0,
    /// Accepting connections
    Listening = 1,
    /// Listener closed, waiting for sessions to finish
    Draining = 2,
    /// All sessions finished
    Stopped = 3,
}

impl From<u8> for ServerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Listening,
            2 => ServerState::Draining,
            _ => ServerState::Stopped,
        }
    }
}

/// SOCKS4/4A proxy server
pub struct Server {
    config: Arc<ServerConfig>,
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    state: Arc<AtomicU8>,
    /// Cancelled by `shutdown` to stop the accept loop
    shutdown_token: CancellationToken,
    /// Cancelled by the accept loop once its listener is dropped
    closed_token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
    /// Serializes `start` and `shutdown`
    lifecycle: Mutex<()>,
}

impl Server {
    /// Create a server with the TCP transport
    pub fn new(config: ServerConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        ServerState::from(self.state.load(Ordering::Acquire))
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Number of sessions still in flight
    pub fn active_sessions(&self) -> usize {
        self.sessions.session_count()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listen address and spawn the accept loop.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Err(current) = self.state.compare_exchange(
            ServerState::Idle as u8,
            ServerState::Listening as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ServerState::from(current) {
                ServerState::Listening => Socks4Error::InvalidState("server is already running"),
                _ => Socks4Error::InvalidState("server has been shut down"),
            });
        }

        let bound = match self.transport.listen(&self.config.listen_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.state.store(ServerState::Idle as u8, Ordering::Release);
                return Err(Socks4Error::Bind(e));
            }
        };
        let _ = self.local_addr.set(local_addr);

        let limiter = (self.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_connections)));

        log::info!(
            address = %local_addr,
            max_connections = self.config.max_connections,
            bind_timeout = ?self.config.bind_timeout,
            "SOCKS4 server listening"
        );

        let runner = AcceptLoop {
            ctx: SessionContext {
                config: Arc::clone(&self.config),
                transport: Arc::clone(&self.transport),
                sessions: self.sessions.clone(),
            },
            state: Arc::clone(&self.state),
            shutdown: self.shutdown_token.clone(),
            closed: self.closed_token.clone(),
            limiter,
        };
        tokio::spawn(accept_loop(listener, runner));

        Ok(local_addr)
    }

    /// Start and wait until the accept loop ends (after `shutdown`).
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.closed_token.cancelled().await;
        Ok(())
    }

    /// Stop accepting, close the listener and wait for every session to finish.
    ///
    /// Draining is cooperative: in-flight relays are never interrupted.
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ServerState::Idle => return Err(Socks4Error::NotStarted),
            ServerState::Stopped => return Ok(()),
            ServerState::Listening | ServerState::Draining => {}
        }

        self.state
            .store(ServerState::Draining as u8, Ordering::Release);
        self.shutdown_token.cancel();
        self.closed_token.cancelled().await;

        log::info!(
            active = self.sessions.session_count(),
            "server is shut down, waiting for existing connections to complete"
        );
        self.sessions.wait_idle().await;

        self.state.store(ServerState::Stopped as u8, Ordering::Release);
        log::info!("all connections are complete");
        Ok(())
    }
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    config: Option<ServerConfig>,
    transport: Option<Arc<dyn Transport>>,
    sessions: Option<SessionManager>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a new server builder with default settings
    pub fn new() -> Self {
        Self {
            config: None,
            transport: None,
            sessions: None,
        }
    }

    /// Set server configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the listen/dial transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set session manager
    pub fn sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Build the server
    ///
    /// Missing pieces fall back to defaults; the transport defaults to TCP
    /// tuned from the config.
    pub fn build(self) -> Server {
        let config = self.config.unwrap_or_default();
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(TcpTransport::new(config.tcp_backlog, config.tcp_nodelay))
        });
        Server {
            config: Arc::new(config),
            transport,
            sessions: self.sessions.unwrap_or_default(),
            state: Arc::new(AtomicU8::new(ServerState::Idle as u8)),
            shutdown_token: CancellationToken::new(),
            closed_token: CancellationToken::new(),
            local_addr: OnceLock::new(),
            lifecycle: Mutex::new(()),
        }
    }
}
