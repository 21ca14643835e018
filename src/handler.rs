//! Connection handling logic
//!
//! Reads the SOCKS4 request, establishes the peer connection for CONNECT or
//! BIND, writes the reply (two for BIND) and hands both ends to the relay.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::ServerConfig;
use crate::core::{
    decode_request, frame_len, relay, Command, RelayStats, Reply, Request, SessionId, SessionManager,
};
use crate::error::{Result, Socks4Error};
use crate::logger::log;
use crate::transport::{Connection, Transport, TransportStream};

/// Everything a session needs from the server
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub transport: Arc<dyn Transport>,
    pub sessions: SessionManager,
}

/// Read one complete request from the stream.
///
/// Returns the request and any bytes the client sent after it. On EOF the
/// buffered bytes are decoded as-is so truncated input maps to a decode error.
pub async fn read_request(
    stream: &mut TransportStream,
    max_request_size: usize,
) -> Result<(Request, Bytes)> {
    let mut buf = BytesMut::with_capacity(max_request_size.min(512));
    let mut temp_buf = [0u8; 512];

    loop {
        let n = stream.read(&mut temp_buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(Socks4Error::ConnectionClosed);
            }
            let request = decode_request(&buf)?;
            return Ok((request, Bytes::new()));
        }
        buf.extend_from_slice(&temp_buf[..n]);

        match frame_len(&buf) {
            Some(len) if len > max_request_size => {
                return Err(Socks4Error::RequestTooLarge(max_request_size));
            }
            Some(len) => {
                let frame = buf.split_to(len);
                let request = decode_request(&frame)?;
                return Ok((request, buf.freeze()));
            }
            // Pipelined bytes only follow a complete frame, so an
            // unterminated buffer past the limit can never become valid
            None if buf.len() > max_request_size => {
                return Err(Socks4Error::RequestTooLarge(max_request_size));
            }
            None => {}
        }
    }
}

/// Write a single reply
async fn send_reply(stream: &mut TransportStream, reply: Reply) -> std::io::Result<()> {
    stream.write_all(&reply.encode()).await?;
    stream.flush().await
}

/// Best-effort failure reply; a write error is logged but never replaces the cause.
async fn send_rejection(stream: &mut TransportStream, peer_addr: &str) {
    if let Err(e) = send_reply(stream, Reply::rejected()).await {
        log::warn!(peer = %peer_addr, error = %e, "Failed to send rejection reply");
    }
}

/// Process a single accepted client connection through handshake and relay
pub async fn process_connection(
    ctx: &SessionContext,
    session_id: SessionId,
    mut client: Connection,
) -> Result<RelayStats> {
    let peer_addr = client.peer_addr.to_string();

    let (request, pending) = tokio::time::timeout(
        ctx.config.request_timeout,
        read_request(&mut client.stream, ctx.config.max_request_size),
    )
    .await
    .map_err(|_| Socks4Error::RequestTimeout)??;

    log::request(&peer_addr, &request);
    ctx.sessions.record_request(session_id, &request);

    let mut peer = match request.command {
        Command::Connect => handle_connect(ctx, &mut client.stream, &request, &peer_addr).await?,
        Command::Bind => handle_bind(ctx, &mut client.stream, &request, &peer_addr).await?,
    };

    log::info!(
        peer = %peer_addr,
        remote = %peer.peer_addr,
        command = %request.command,
        "Proxy established"
    );

    // Bytes the client pipelined behind the request belong to the peer
    if !pending.is_empty() {
        peer.stream.write_all(&pending).await?;
    }

    let mut stats = relay(client.stream, peer.stream, ctx.config.buffer_size).await;
    stats.client_to_peer += pending.len() as u64;

    log::relay(&peer_addr, stats.client_to_peer, stats.peer_to_client);
    Ok(stats)
}

/// Handle CONNECT: one dial attempt, then a single reply
async fn handle_connect(
    ctx: &SessionContext,
    client: &mut TransportStream,
    request: &Request,
    peer_addr: &str,
) -> Result<Connection> {
    let target = request.address();
    log::debug!(peer = %peer_addr, target = %target, "Connecting to target");

    let dialed = match tokio::time::timeout(ctx.config.connect_timeout, ctx.transport.dial(&target))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    };

    let remote = match dialed {
        Ok(remote) => remote,
        Err(source) => {
            send_rejection(client, peer_addr).await;
            return Err(Socks4Error::DialFailure {
                addr: target,
                source,
            });
        }
    };

    // On failure `remote` is dropped here, closing the outbound connection
    send_reply(client, Reply::granted(remote.local_addr))
        .await
        .map_err(Socks4Error::ReplyWrite)?;

    Ok(remote)
}

/// Handle BIND: listen, first reply, wait for one inbound peer, second reply.
///
/// The inbound peer's address is not compared with the request target.
async fn handle_bind(
    ctx: &SessionContext,
    client: &mut TransportStream,
    request: &Request,
    peer_addr: &str,
) -> Result<Connection> {
    let listen_addr = ctx.config.bind_listen_addr();

    let bound = match ctx.transport.listen(&listen_addr).await {
        Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
        Err(e) => Err(e),
    };
    let (listener, bound_addr) = match bound {
        Ok(bound) => bound,
        Err(e) => {
            send_rejection(client, peer_addr).await;
            return Err(Socks4Error::Bind(e));
        }
    };

    log::debug!(
        peer = %peer_addr,
        bound = %bound_addr,
        target = %request.addr,
        "BIND listener opened"
    );

    send_reply(client, Reply::granted(bound_addr))
        .await
        .map_err(Socks4Error::ReplyWrite)?;

    // The listener is dropped on every path out of this block, so no second
    // inbound connection is ever accepted.
    let accepted = {
        let accepted = tokio::time::timeout(ctx.config.bind_timeout, listener.accept()).await;
        drop(listener);
        accepted
    };

    let remote = match accepted {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => return Err(Socks4Error::Accept(e)),
        Err(_) => {
            log::debug!(peer = %peer_addr, bound = %bound_addr, "BIND wait timed out");
            return Err(Socks4Error::AcceptTimeout);
        }
    };

    log::debug!(peer = %peer_addr, inbound = %remote.peer_addr, "BIND inbound connection accepted");

    send_reply(client, Reply::granted(remote.local_addr))
        .await
        .map_err(Socks4Error::ReplyWrite)?;

    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReplyStatus;
    use crate::transport::TcpTransport;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    fn test_ctx(config: ServerConfig) -> SessionContext {
        SessionContext {
            config: Arc::new(config),
            transport: Arc::new(TcpTransport::default()),
            sessions: SessionManager::new(),
        }
    }

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".to_string(),
            bind_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        }
    }

    /// Client side of an in-memory session plus the Connection the handler sees
    fn client_pair() -> (DuplexStream, Connection) {
        let (client, server_side) = duplex(64 * 1024);
        let local: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        (client, Connection::new(server_side, local, peer))
    }

    fn connect_request(addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("expected IPv4 address");
        };
        let mut buf = vec![0x04, 0x01];
        buf.extend_from_slice(&v4.port().to_be_bytes());
        buf.extend_from_slice(&v4.ip().octets());
        buf.extend_from_slice(b"tester\0");
        buf
    }

    async fn read_reply(stream: &mut DuplexStream) -> [u8; 8] {
        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_read_request_split_across_reads() {
        let (mut client, mut conn) = client_pair();
        let writer = tokio::spawn(async move {
            client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(&[0x50, 7, 7, 7, 7, b'u', 0]).await.unwrap();
            client
        });

        let (req, pending) = read_request(&mut conn.stream, 1024).await.unwrap();
        assert_eq!(req.address(), "7.7.7.7:80");
        assert_eq!(req.identity, "u");
        assert!(pending.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_request_keeps_pipelined_bytes() {
        let (mut client, mut conn) = client_pair();
        client
            .write_all(b"\x04\x01\x00\x50\x07\x07\x07\x07\x00GET / HTTP/1.0\r\n")
            .await
            .unwrap();

        let (req, pending) = read_request(&mut conn.stream, 1024).await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(pending.as_ref(), b"GET / HTTP/1.0\r\n");
    }

    #[tokio::test]
    async fn test_read_request_truncated_is_malformed() {
        let (mut client, mut conn) = client_pair();
        client.write_all(&[0x04, 0x01, 0x00, 0x50, 0x07]).await.unwrap();
        drop(client);

        let err = read_request(&mut conn.stream, 1024).await.unwrap_err();
        assert!(matches!(err, Socks4Error::MalformedRequest));
    }

    #[tokio::test]
    async fn test_read_request_empty_connection() {
        let (client, mut conn) = client_pair();
        drop(client);
        let err = read_request(&mut conn.stream, 1024).await.unwrap_err();
        assert!(matches!(err, Socks4Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_request_too_large() {
        let (mut client, mut conn) = client_pair();
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 7, 7, 7, 7];
        buf.extend(std::iter::repeat(b'a').take(64));
        client.write_all(&buf).await.unwrap();

        let err = read_request(&mut conn.stream, 32).await.unwrap_err();
        assert!(matches!(err, Socks4Error::RequestTooLarge(32)));
    }

    #[tokio::test]
    async fn test_read_request_complete_but_oversized() {
        let (mut client, mut conn) = client_pair();
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 7, 7, 7, 7];
        buf.extend(std::iter::repeat(b'u').take(400));
        buf.push(0);
        // The whole frame lands in a single read
        client.write_all(&buf).await.unwrap();

        let err = read_request(&mut conn.stream, 32).await.unwrap_err();
        assert!(matches!(err, Socks4Error::RequestTooLarge(32)));
    }

    #[tokio::test]
    async fn test_read_request_at_size_limit() {
        let (mut client, mut conn) = client_pair();
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 7, 7, 7, 7];
        buf.extend(std::iter::repeat(b'u').take(23));
        buf.push(0);
        client.write_all(&buf).await.unwrap();

        let (req, _) = read_request(&mut conn.stream, 32).await.unwrap();
        assert_eq!(req.identity.len(), 23);
    }

    #[tokio::test]
    async fn test_malformed_request_sends_no_reply() {
        let ctx = test_ctx(loopback_config());
        let (mut client, conn) = client_pair();
        client.write_all(&[0x04, 0x01, 0x00, 0x50, 0x07]).await.unwrap();
        client.shutdown().await.unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::MalformedRequest));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_version_sends_no_reply() {
        let ctx = test_ctx(loopback_config());
        let (mut client, conn) = client_pair();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x50, 7, 7, 7, 7, 0x00])
            .await
            .unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::UnsupportedVersion(0x05)));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let mut config = loopback_config();
        config.request_timeout = Duration::from_millis(50);
        let ctx = test_ctx(config);
        let (mut client, conn) = client_pair();
        client.write_all(&[0x04, 0x01]).await.unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::RequestTimeout));
        drop(client);
    }

    #[tokio::test]
    async fn test_connect_relays_data() {
        let ctx = test_ctx(loopback_config());
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (mut client, conn) = client_pair();
        let session = tokio::spawn(async move { process_connection(&ctx, 0, conn).await });

        client.write_all(&connect_request(target_addr)).await.unwrap();
        let (mut upstream, _) = target.accept().await.unwrap();

        let reply = read_reply(&mut client).await;
        assert_eq!(reply[0], 0x00);
        assert_eq!(reply[1], ReplyStatus::Granted as u8);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(upstream);
        drop(client);
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.client_to_peer, 4);
        assert_eq!(stats.peer_to_client, 4);
    }

    #[tokio::test]
    async fn test_connect_forwards_pipelined_bytes() {
        let ctx = test_ctx(loopback_config());
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (mut client, conn) = client_pair();
        let session = tokio::spawn(async move { process_connection(&ctx, 0, conn).await });

        let mut request = connect_request(target_addr);
        request.extend_from_slice(b"early");
        client.write_all(&request).await.unwrap();

        let (mut upstream, _) = target.accept().await.unwrap();
        let reply = read_reply(&mut client).await;
        assert_eq!(reply[1], 0x5a);

        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        drop(upstream);
        drop(client);
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.client_to_peer, 5);
    }

    #[tokio::test]
    async fn test_connect_dial_failure_sends_rejection() {
        let ctx = test_ctx(loopback_config());
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (mut client, conn) = client_pair();
        client.write_all(&connect_request(closed_addr)).await.unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::DialFailure { .. }));

        let reply = read_reply(&mut client).await;
        assert_eq!(reply, [0x00, 0x5b, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_session_records_decoded_request() {
        let ctx = test_ctx(loopback_config());
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (mut client, conn) = client_pair();
        let session_id = ctx.sessions.register(conn.peer_addr);
        client.write_all(&connect_request(closed_addr)).await.unwrap();
        let _ = process_connection(&ctx, session_id, conn).await;

        let info = ctx.sessions.unregister(session_id).unwrap();
        assert_eq!(info.command, Some(Command::Connect));
        assert_eq!(
            info.target.map(|t| t.to_string()),
            Some(closed_addr.to_string())
        );
    }

    #[tokio::test]
    async fn test_bind_two_replies_and_relay() {
        let ctx = test_ctx(loopback_config());
        let (mut client, conn) = client_pair();
        let session = tokio::spawn(async move { process_connection(&ctx, 0, conn).await });

        client
            .write_all(&[0x04, 0x02, 0x00, 0x00, 127, 0, 0, 1, 0x00])
            .await
            .unwrap();

        let first = read_reply(&mut client).await;
        assert_eq!(first[1], 0x5a);
        let port = u16::from_be_bytes([first[2], first[3]]);
        assert_ne!(port, 0);
        assert_eq!(&first[4..8], &[127, 0, 0, 1]);

        let mut inbound = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();

        let second = read_reply(&mut client).await;
        assert_eq!(second[1], 0x5a);
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), port);

        inbound.write_all(b"from inbound").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from inbound");

        client.write_all(b"to inbound").await.unwrap();
        let mut buf = [0u8; 10];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to inbound");

        drop(inbound);
        drop(client);
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.client_to_peer, 10);
        assert_eq!(stats.peer_to_client, 12);
    }

    #[tokio::test]
    async fn test_bind_accepts_only_one_inbound() {
        let ctx = test_ctx(loopback_config());
        let (mut client, conn) = client_pair();
        let session = tokio::spawn(async move { process_connection(&ctx, 0, conn).await });

        client
            .write_all(&[0x04, 0x02, 0x00, 0x00, 127, 0, 0, 1, 0x00])
            .await
            .unwrap();
        let first = read_reply(&mut client).await;
        let port = u16::from_be_bytes([first[2], first[3]]);

        let inbound = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let _second = read_reply(&mut client).await;

        // Listener is gone once the first peer was accepted
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err());

        drop(inbound);
        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_timeout_sends_only_first_reply() {
        let mut config = loopback_config();
        config.bind_timeout = Duration::from_millis(100);
        let ctx = test_ctx(config);
        let (mut client, conn) = client_pair();

        client
            .write_all(&[0x04, 0x02, 0x00, 0x00, 127, 0, 0, 1, 0x00])
            .await
            .unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::AcceptTimeout));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), Reply::SIZE);
        assert_eq!(rest[1], 0x5a);

        let port = u16::from_be_bytes([rest[2], rest[3]]);
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bind_listen_failure_sends_rejection() {
        let mut config = loopback_config();
        // TEST-NET-1, never assigned to a local interface
        config.bind_host = "192.0.2.1".to_string();
        let ctx = test_ctx(config);
        let (mut client, conn) = client_pair();

        client
            .write_all(&[0x04, 0x02, 0x00, 0x00, 127, 0, 0, 1, 0x00])
            .await
            .unwrap();

        let err = process_connection(&ctx, 0, conn).await.unwrap_err();
        assert!(matches!(err, Socks4Error::Bind(_)));

        let reply = read_reply(&mut client).await;
        assert_eq!(reply[1], 0x5b);
    }
}
