//! Bidirectional relay
//!
//! Each direction runs on its own task and ends independently: EOF or an I/O
//! error on one side only stops that direction, after half-closing its
//! destination.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::logger::log;

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes transferred from client to peer (upload)
    pub client_to_peer: u64,
    /// Bytes transferred from peer to client (download)
    pub peer_to_client: u64,
}

/// Copy from `reader` to `writer` until EOF or error, then shut down `writer`.
async fn pipe<R, W>(mut reader: R, mut writer: W, buffer_size: usize, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::debug!(direction, error = %e, "Relay read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            log::debug!(direction, error = %e, "Relay write ended");
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}

/// Relay bytes between `client` and `peer` until both directions finish.
///
/// Both streams are dropped (closed) when this returns.
pub async fn relay<A, B>(client: A, peer: B, buffer_size: usize) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (peer_read, peer_write) = tokio::io::split(peer);

    let upload = tokio::spawn(pipe(client_read, peer_write, buffer_size, "client->peer"));
    let download = tokio::spawn(pipe(peer_read, client_write, buffer_size, "peer->client"));

    let (upload, download) = tokio::join!(upload, download);

    RelayStats {
        client_to_peer: upload.unwrap_or_default(),
        peer_to_client: download.unwrap_or_default(),
    }
}
