//! Listener setup and connection admission for the server role.
//!
//! The accept loop pipelines: each accepted connection is handed to its
//! own service task and the loop immediately goes back to accepting.
//! Admission happens inside the service task — it must hold one permit
//! from a semaphore sized to `max_connections` before its reader starts,
//! so a burst of accepts beyond the limit parks until earlier
//! connections finish. The connected-clients counter counts accepted
//! connections, parked ones included, and drops as each service ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error};

use crate::chunk::ChunkSender;
use crate::connection::{Connection, ConnectionId, ConnectionRegistry};
use crate::pool::Pool;
use crate::reader::read_loop;

/// Everything a server connection's service needs, shared across the
/// accept loop and all service tasks.
pub(crate) struct AcceptorShared {
    pub registry: Arc<ConnectionRegistry>,
    pub connected: Arc<AtomicU32>,
    pub permits: Arc<Semaphore>,
    pub buffers: Arc<Pool<Vec<u8>>>,
    pub chunks: ChunkSender,
    pub shutdown: watch::Receiver<bool>,
}

/// Bind a listener with an explicit backlog.
pub(crate) fn bind(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept connections until shutdown.
pub(crate) async fn accept_loop(listener: TcpListener, shared: Arc<AcceptorShared>) {
    let mut shutdown = shared.shutdown.clone();
    let mut next_id: ConnectionId = 1;

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                debug!("acceptor shut down");
                break;
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                let id = next_id;
                next_id = next_id.wrapping_add(1);
                shared.connected.fetch_add(1, Ordering::SeqCst);
                debug!(connection_id = id, %peer, "connection accepted");
                tokio::spawn(serve_connection(id, stream, peer, shared.clone()));
                // Loop continues immediately; the next accept overlaps the
                // admission wait of this one.
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

/// One connection's service: admission, registration, then the reader.
async fn serve_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<AcceptorShared>,
) {
    // Decrements the counter and deregisters however this task ends.
    let _guard = ConnectionGuard {
        connected: shared.connected.clone(),
        registry: shared.registry.clone(),
        id,
    };

    // Parks while `max_connections` earlier connections are in service;
    // an Err means the semaphore was closed by role shutdown.
    let _permit = match shared.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let (read_half, write_half) = stream.into_split();
    let connection = Arc::new(Connection::new(id, peer, write_half));
    let stop = Arc::new(Notify::new());
    shared.registry.insert(connection, stop.clone());

    read_loop(
        id,
        read_half,
        shared.buffers.clone(),
        shared.chunks.clone(),
        shared.shutdown.clone(),
        stop,
    )
    .await;

    debug!(connection_id = id, "connection service finished");
}

struct ConnectionGuard {
    connected: Arc<AtomicU32>,
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connected.fetch_sub(1, Ordering::SeqCst);
        self.registry.remove(self.id);
    }
}
