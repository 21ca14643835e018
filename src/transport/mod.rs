//! Transport layer abstraction
//!
//! The proxy only needs listen/accept/dial over byte streams. `Transport` and
//! `Listener` are the seams; `TcpTransport` is the implementation used by the
//! binary. Closing a connection or listener is dropping it.

mod tcp;

pub use tcp::{TcpListenerHandle, TcpTransport};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// An established byte stream with its endpoint addresses
pub struct Connection {
    /// Byte stream
    pub stream: TransportStream,
    /// Address of our end
    pub local_addr: SocketAddr,
    /// Address of the remote end
    pub peer_addr: SocketAddr,
}

impl Connection {
    pub fn new<S>(stream: S, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self
    where
        S: AsyncStream + 'static,
    {
        Self {
            stream: Box::pin(stream),
            local_addr,
            peer_addr,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Listening endpoint
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> io::Result<Connection>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Listen/dial capability used by the server and the session handler
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener on `addr` (port 0 picks an ephemeral port)
    async fn listen(&self, addr: &str) -> io::Result<Box<dyn Listener>>;

    /// Open an outbound connection to `addr` (`host:port`), single attempt
    async fn dial(&self, addr: &str) -> io::Result<Connection>;
}
