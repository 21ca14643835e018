//! Plain TCP transport

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};

use super::{Connection, Listener, Transport};

/// TCP keepalive idle time and probe interval.
/// Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// TCP transport with socket tuning
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    /// Listen backlog for bound sockets
    backlog: i32,
    /// Set TCP_NODELAY on every stream
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(1024, true)
    }
}

impl TcpTransport {
    pub fn new(backlog: i32, nodelay: bool) -> Self {
        Self { backlog, nodelay }
    }

    fn tune(&self, stream: &TcpStream) {
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
            .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
        let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
    }

    fn wrap(&self, stream: TcpStream) -> io::Result<Connection> {
        self.tune(&stream);
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Ok(Connection::new(stream, local_addr, peer_addr))
    }

    /// Bind with SO_REUSEADDR so restarts skip TIME_WAIT
    fn bind_socket(&self, socket_addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(socket_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(self.backlog)?;
        TcpListener::from_std(socket.into())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: &str) -> io::Result<Box<dyn Listener>> {
        let socket_addr = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses found for {}", addr),
            )
        })?;
        let listener = self.bind_socket(socket_addr)?;
        Ok(Box::new(TcpListenerHandle {
            listener,
            transport: *self,
        }))
    }

    async fn dial(&self, addr: &str) -> io::Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        self.wrap(stream)
    }
}

/// Bound TCP listener; dropping it closes the socket
pub struct TcpListenerHandle {
    listener: TcpListener,
    transport: TcpTransport,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.listener.accept().await?;
        self.transport.wrap(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
