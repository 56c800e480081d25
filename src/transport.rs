//! The transport facade.
//!
//! [`CacheTransport`] is the single externally visible object. It is
//! role-agnostic until activated: `connect` turns it into a client,
//! `listen` into a server, `close` back to idle. Calling a role-scoped
//! method in the wrong role is a state-misuse error, never silent
//! misbehavior.
//!
//! # Client example
//!
//! ```ignore
//! let transport = CacheTransport::new(4096, 16)?;
//! transport.connect(server_addr).await?;
//!
//! let id = transport.client_send(Bytes::from_static(b"get k"), true).await?;
//! let reply = transport.client_receive(id).await?;
//! ```
//!
//! # Server example
//!
//! ```ignore
//! let transport = CacheTransport::new(4096, 64)?;
//! let reply_via = transport.clone();
//! transport
//!     .listen(bind_addr, move |message: ReceivedMessage| {
//!         let transport = reply_via.clone();
//!         async move {
//!             let reply = message.payload().clone();
//!             if let Err(e) = transport.server_send(reply, message).await {
//!                 tracing::error!(error = %e, "reply failed");
//!             }
//!         }
//!     })
//!     .await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::acceptor::{accept_loop, bind, AcceptorShared};
use crate::chunk::{chunk_queue, QUEUE_DEPTH_PER_CONNECTION};
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{Result, TransportError};
use crate::handler::{MessageHandler, ReceivedMessage};
use crate::multiplexer::ResponseMultiplexer;
use crate::pool::Pool;
use crate::protocol::{build_frame, FrameDecoder};
use crate::reader::{decode_loop, read_loop, FrameSink};

/// Smallest accepted receive buffer.
pub const MIN_BUFFER_SIZE: usize = 256;

/// Reply latches retained for reuse across registrations.
const LATCH_POOL_CAPACITY: usize = 64;

/// Dual-role framed TCP transport.
///
/// Cheaply cloneable; clones share the same underlying transport, which
/// is how a server handler gets a handle for replying.
#[derive(Clone)]
pub struct CacheTransport {
    inner: Arc<Inner>,
}

struct Inner {
    buffer_size: usize,
    max_connections: usize,
    buffers: Arc<Pool<Vec<u8>>>,
    decoders: Arc<Pool<FrameDecoder>>,
    handoffs: Arc<Pool<ReceivedMessage>>,
    next_correlation: AtomicU32,
    disposed: AtomicBool,
    role: Mutex<Role>,
}

/// Active role of the facade. At most one at a time; transitions only
/// through `close`.
enum Role {
    Idle,
    Client(ClientRole),
    Server(ServerRole),
}

struct ClientRole {
    connection: Arc<Connection>,
    multiplexer: Arc<ResponseMultiplexer>,
    shutdown: Arc<watch::Sender<bool>>,
    stop: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

struct ServerRole {
    registry: Arc<ConnectionRegistry>,
    connected: Arc<AtomicU32>,
    permits: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl CacheTransport {
    /// Create an idle transport.
    ///
    /// `buffer_size` is the size of each pooled receive buffer (at least
    /// [`MIN_BUFFER_SIZE`]); `max_connections` bounds admitted server
    /// connections (at least 1) and sizes the chunk queue and buffer
    /// pool.
    pub fn new(buffer_size: usize, max_connections: usize) -> Result<Self> {
        if buffer_size < MIN_BUFFER_SIZE {
            return Err(TransportError::BadArgument(format!(
                "buffer_size {} is below the minimum {}",
                buffer_size, MIN_BUFFER_SIZE
            )));
        }
        if max_connections < 1 {
            return Err(TransportError::BadArgument(
                "max_connections must be at least 1".into(),
            ));
        }

        let pooled_buffers = QUEUE_DEPTH_PER_CONNECTION * max_connections;
        let buffers = Arc::new(
            Pool::new(pooled_buffers, move || vec![0u8; buffer_size]).prefill(pooled_buffers),
        );
        let decoders = Arc::new(Pool::with_reset(
            max_connections,
            FrameDecoder::new,
            FrameDecoder::reset,
        ));
        let handoffs = Arc::new(Pool::with_reset(
            pooled_buffers,
            ReceivedMessage::empty,
            ReceivedMessage::clear,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                buffer_size,
                max_connections,
                buffers,
                decoders,
                handoffs,
                next_correlation: AtomicU32::new(1),
                disposed: AtomicBool::new(false),
                role: Mutex::new(Role::Idle),
            }),
        })
    }

    /// Receive buffer size this transport was built with.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Connection limit this transport was built with.
    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Connect to a remote peer and become a client.
    ///
    /// Resolves once the socket is connected; the connection's reader and
    /// decode worker are running when this returns.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<()> {
        self.ensure_not_disposed()?;
        self.ensure_idle("connect")?;

        let stream = TcpStream::connect(endpoint).await?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "connected");

        let queue_depth = QUEUE_DEPTH_PER_CONNECTION * self.inner.max_connections;
        let (chunk_tx, chunk_rx) = chunk_queue(queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let stop = Arc::new(Notify::new());
        let multiplexer = Arc::new(ResponseMultiplexer::new(LATCH_POOL_CAPACITY));

        let (read_half, write_half) = stream.into_split();
        let connection = Arc::new(Connection::new(0, peer, write_half));

        let reader = tokio::spawn(read_loop(
            0,
            read_half,
            self.inner.buffers.clone(),
            chunk_tx,
            shutdown_rx,
            stop.clone(),
        ));
        let worker = tokio::spawn(decode_loop(
            chunk_rx,
            self.inner.decoders.clone(),
            self.inner.buffers.clone(),
            FrameSink::Client {
                multiplexer: multiplexer.clone(),
                shutdown: shutdown.clone(),
            },
        ));

        let client = ClientRole {
            connection,
            multiplexer,
            shutdown,
            stop,
            tasks: vec![reader, worker],
        };

        // The role may have been taken while we were connecting.
        let mut role = self.lock_role();
        match &*role {
            Role::Idle => {
                *role = Role::Client(client);
                Ok(())
            }
            _ => {
                drop(role);
                shutdown_role(Role::Client(client));
                Err(TransportError::StateMisuse(
                    "connect while a role is already active".into(),
                ))
            }
        }
    }

    /// Bind, start accepting, and become a server.
    ///
    /// Returns as soon as the accept loop is running; `handler` is
    /// invoked on the decode worker for every received message.
    pub async fn listen<H>(&self, endpoint: SocketAddr, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        self.ensure_not_disposed()?;

        let queue_depth = QUEUE_DEPTH_PER_CONNECTION * self.inner.max_connections;
        let (chunk_tx, chunk_rx) = chunk_queue(queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let registry = Arc::new(ConnectionRegistry::new());
        let connected = Arc::new(AtomicU32::new(0));
        let permits = Arc::new(Semaphore::new(self.inner.max_connections));

        // Bind and install under one lock; nothing here suspends.
        let mut role = self.lock_role();
        if !matches!(&*role, Role::Idle) {
            return Err(TransportError::StateMisuse(
                "listen while a role is already active".into(),
            ));
        }

        let listener = bind(endpoint, self.inner.max_connections as u32)?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "listening");

        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::new(AcceptorShared {
                registry: registry.clone(),
                connected: connected.clone(),
                permits: permits.clone(),
                buffers: self.inner.buffers.clone(),
                chunks: chunk_tx,
                shutdown: shutdown_rx,
            }),
        ));
        let worker = tokio::spawn(decode_loop(
            chunk_rx,
            self.inner.decoders.clone(),
            self.inner.buffers.clone(),
            FrameSink::Server {
                handler: Arc::new(handler),
                registry: registry.clone(),
                handoffs: self.inner.handoffs.clone(),
            },
        ));

        *role = Role::Server(ServerRole {
            registry,
            connected,
            permits,
            shutdown,
            local_addr,
            tasks: vec![acceptor, worker],
        });
        Ok(())
    }

    /// Address the server role is listening on, while it is active.
    ///
    /// Useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let role = self.lock_role();
        match &*role {
            Role::Server(server) => Some(server.local_addr),
            _ => None,
        }
    }

    /// Send a request over the client connection.
    ///
    /// Allocates and returns this request's correlation id. With
    /// `register_for_response`, the caller is registered with the
    /// multiplexer *before* the frame is written, so a reply can never
    /// race past its waiter; pass the returned id to
    /// [`client_receive`](Self::client_receive). Registration fails with
    /// [`TransportError::Canceled`] once the connection has been torn
    /// down, even while the facade still shows the client role.
    pub async fn client_send(&self, payload: Bytes, register_for_response: bool) -> Result<u32> {
        self.ensure_not_disposed()?;
        let (connection, multiplexer) = {
            let role = self.lock_role();
            match &*role {
                Role::Client(client) => {
                    (client.connection.clone(), client.multiplexer.clone())
                }
                _ => {
                    return Err(TransportError::StateMisuse(
                        "client_send requires the client role".into(),
                    ))
                }
            }
        };

        let correlation_id = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        if register_for_response {
            multiplexer.register(correlation_id)?;
        }

        let frame = build_frame(correlation_id, &payload);
        if let Err(e) = connection.send_frame(&frame).await {
            if register_for_response {
                multiplexer.unregister(correlation_id);
            }
            return Err(e);
        }

        Ok(correlation_id)
    }

    /// Await the reply registered under `correlation_id`.
    ///
    /// Unregisters the id and returns the payload, or
    /// [`TransportError::Canceled`] if the transport closed first.
    pub async fn client_receive(&self, correlation_id: u32) -> Result<Bytes> {
        self.ensure_not_disposed()?;
        let multiplexer = {
            let role = self.lock_role();
            match &*role {
                Role::Client(client) => client.multiplexer.clone(),
                _ => {
                    return Err(TransportError::StateMisuse(
                        "client_receive requires the client role".into(),
                    ))
                }
            }
        };
        multiplexer.wait(correlation_id).await
    }

    /// Reply to a received message over its source connection.
    ///
    /// Encodes with the received correlation id and submits one
    /// contiguous write; the handoff record returns to its pool
    /// afterwards. Replying to a connection that has since closed is a
    /// bad-argument error.
    pub async fn server_send(&self, payload: Bytes, reply_to: ReceivedMessage) -> Result<()> {
        self.ensure_not_disposed()?;
        {
            let role = self.lock_role();
            if !matches!(&*role, Role::Server(_)) {
                return Err(TransportError::StateMisuse(
                    "server_send requires the server role".into(),
                ));
            }
        }

        let result = match reply_to.connection() {
            Some(connection) => {
                let frame = build_frame(reply_to.correlation_id(), &payload);
                connection.send_frame(&frame).await
            }
            None => Err(TransportError::BadArgument(
                "reply target connection is gone".into(),
            )),
        };

        self.inner.handoffs.release(reply_to);
        result
    }

    /// Number of currently connected clients (server role; 0 otherwise).
    pub fn connected_clients(&self) -> u32 {
        let role = self.lock_role();
        match &*role {
            Role::Server(server) => server.connected.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Shut down the active role and return to idle.
    ///
    /// Client role: every outstanding `client_receive` is released with
    /// [`TransportError::Canceled`]. Idempotent; the transport can
    /// `connect` or `listen` again afterwards.
    pub async fn close(&self) -> Result<()> {
        let previous = {
            let mut role = self.lock_role();
            std::mem::replace(&mut *role, Role::Idle)
        };
        shutdown_role(previous);
        Ok(())
    }

    /// Permanent teardown: close the active role and drain every pool.
    ///
    /// All subsequent operations fail with state-misuse.
    pub async fn dispose(&self) -> Result<()> {
        self.close().await?;
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.buffers.drain();
        self.inner.decoders.drain();
        self.inner.handoffs.drain();
        Ok(())
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::StateMisuse("transport is disposed".into()));
        }
        Ok(())
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        let role = self.lock_role();
        if matches!(&*role, Role::Idle) {
            Ok(())
        } else {
            Err(TransportError::StateMisuse(format!(
                "{} while a role is already active",
                operation
            )))
        }
    }

    fn lock_role(&self) -> std::sync::MutexGuard<'_, Role> {
        self.inner.role.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CacheTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = self.lock_role();
        let name = match &*role {
            Role::Idle => "idle",
            Role::Client(_) => "client",
            Role::Server(_) => "server",
        };
        f.debug_struct("CacheTransport")
            .field("role", &name)
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_connections", &self.inner.max_connections)
            .finish()
    }
}

/// Tear down whatever a role left running. Safe on `Idle`.
fn shutdown_role(role: Role) {
    match role {
        Role::Idle => {}
        Role::Client(client) => {
            let _ = client.shutdown.send(true);
            client.stop.notify_one();
            client.multiplexer.cancel_all();
            for task in client.tasks {
                task.abort();
            }
            debug!("client role closed");
        }
        Role::Server(server) => {
            let _ = server.shutdown.send(true);
            server.registry.stop_all();
            server.permits.close();
            for task in server.tasks {
                task.abort();
            }
            debug!("server role closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_small_buffer() {
        let result = CacheTransport::new(255, 4);
        assert!(matches!(result, Err(TransportError::BadArgument(_))));
    }

    #[test]
    fn test_new_rejects_zero_connections() {
        let result = CacheTransport::new(4096, 0);
        assert!(matches!(result, Err(TransportError::BadArgument(_))));
    }

    #[test]
    fn test_new_prefills_buffer_pool() {
        let transport = CacheTransport::new(256, 3).unwrap();
        assert_eq!(transport.inner.buffers.available(), 30);
        assert_eq!(transport.buffer_size(), 256);
        assert_eq!(transport.max_connections(), 3);
    }

    #[tokio::test]
    async fn test_client_methods_require_client_role() {
        let transport = CacheTransport::new(256, 1).unwrap();

        let send = transport.client_send(Bytes::from_static(b"x"), false).await;
        assert!(matches!(send, Err(TransportError::StateMisuse(_))));

        let receive = transport.client_receive(1).await;
        assert!(matches!(receive, Err(TransportError::StateMisuse(_))));
    }

    #[tokio::test]
    async fn test_server_send_requires_server_role() {
        let transport = CacheTransport::new(256, 1).unwrap();
        let message = ReceivedMessage::empty();

        let result = transport.server_send(Bytes::from_static(b"x"), message).await;
        assert!(matches!(result, Err(TransportError::StateMisuse(_))));
    }

    #[tokio::test]
    async fn test_connected_clients_zero_when_idle() {
        let transport = CacheTransport::new(256, 1).unwrap();
        assert_eq!(transport.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_close_when_idle_is_noop() {
        let transport = CacheTransport::new(256, 1).unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_blocks_further_use() {
        let transport = CacheTransport::new(256, 1).unwrap();
        transport.dispose().await.unwrap();

        assert_eq!(transport.inner.buffers.available(), 0);
        let result = transport.connect("127.0.0.1:1".parse().unwrap()).await;
        assert!(matches!(result, Err(TransportError::StateMisuse(_))));
        let result = transport.client_send(Bytes::new(), false).await;
        assert!(matches!(result, Err(TransportError::StateMisuse(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_io_error() {
        let transport = CacheTransport::new(256, 1).unwrap();
        // Reserve a port, then close it so the connect is refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = transport.connect(addr).await;
        assert!(matches!(result, Err(TransportError::Io(_))));

        // A failed connect leaves the transport idle and usable.
        let role = transport.lock_role();
        assert!(matches!(&*role, Role::Idle));
    }
}
