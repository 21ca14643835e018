//! Accept loop
//!
//! Accepts client connections, registers each one in the session registry
//! and runs it on its own task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::handler::{process_connection, SessionContext};
use crate::logger::log;
use crate::server::ServerState;
use crate::transport::{Connection, Listener};

/// Pause after a failed accept so persistent errors (e.g. EMFILE) don't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between the server and its accept loop
pub struct AcceptLoop {
    pub ctx: SessionContext,
    pub state: Arc<AtomicU8>,
    /// Stops the loop
    pub shutdown: CancellationToken,
    /// Cancelled when the loop has exited and dropped its listener
    pub closed: CancellationToken,
    /// Connection limiter, `None` = unlimited
    pub limiter: Option<Arc<Semaphore>>,
}

impl AcceptLoop {
    fn is_draining(&self) -> bool {
        ServerState::from(self.state.load(Ordering::Acquire)) != ServerState::Listening
    }

    /// Wait for a connection permit, or `Err` once shutting down
    async fn acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        tokio::select! {
            permit = Arc::clone(limiter).acquire_owned() => permit.map(Some).map_err(|_| ()),
            _ = self.shutdown.cancelled() => Err(()),
        }
    }
}

/// Run the accept loop until shutdown; the listener is dropped on exit
pub async fn accept_loop(listener: Box<dyn Listener>, runner: AcceptLoop) {
    let _closed = runner.closed.clone().drop_guard();

    loop {
        // Backpressure when at the connection limit
        let Ok(permit) = runner.acquire_permit().await else {
            break;
        };

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = runner.shutdown.cancelled() => break,
        };

        match accepted {
            Ok(conn) => spawn_session(&runner, conn, permit),
            Err(e) => {
                if runner.is_draining() {
                    break;
                }
                log::warn!(error = %e, "listener accept error");
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    _ = runner.shutdown.cancelled() => break,
                }
            }
        }
    }

    drop(listener);
    log::info!("listener closed");
}

/// Register the connection and handle it on its own task
fn spawn_session(runner: &AcceptLoop, conn: Connection, permit: Option<OwnedSemaphorePermit>) {
    let peer_addr = conn.peer_addr.to_string();
    let session_id = runner.ctx.sessions.register(conn.peer_addr);
    log::connection(&peer_addr, "new");

    let ctx = runner.ctx.clone();

    tokio::spawn(async move {
        // Hold permit for the lifetime of this session
        let _permit = permit;
        // Unregister only after both transports are gone
        let sessions = ctx.sessions.clone();
        let _guard = scopeguard::guard((), move |_| {
            if let Some(info) = sessions.unregister(session_id) {
                log::debug!(
                    session_id,
                    command = ?info.command,
                    target = ?info.target.as_ref().map(|t| t.to_string()),
                    lifetime = ?info.lifetime(),
                    "Session unregistered"
                );
            }
        });

        match process_connection(&ctx, session_id, conn).await {
            Ok(_) => {}
            Err(e) if e.is_decode_error() => {
                log::warn!(peer = %peer_addr, session_id, error = %e, "Invalid request");
            }
            Err(e) => {
                log::warn!(peer = %peer_addr, session_id, error = %e, "establish proxy error");
            }
        }
        log::connection(&peer_addr, "closed");
    });
}
