//! Server-side message dispatch: the user handler contract and the
//! pooled handoff record it receives.
//!
//! Every decoded request frame is wrapped in a [`ReceivedMessage`] and
//! handed to the [`MessageHandler`]. The handler replies by passing the
//! record back through `server_send`, which routes the reply over the
//! record's connection with the received correlation id and then returns
//! the record to its pool.
//!
//! Handlers run on the decode worker. A handler that may block for long
//! must off-load to its own task, or it stalls decoding for every
//! connection behind the shared chunk queue.
//!
//! # Example
//!
//! ```ignore
//! let transport = CacheTransport::new(4096, 64)?;
//! let reply_via = transport.clone();
//! transport
//!     .listen(addr, move |message: ReceivedMessage| {
//!         let transport = reply_via.clone();
//!         async move {
//!             let echoed = message.payload().clone();
//!             let _ = transport.server_send(echoed, message).await;
//!         }
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;

use bytes::Bytes;

use crate::connection::{Connection, ConnectionId};

/// Boxed future returned by message handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User-supplied server message handler.
///
/// Implemented for free by any `Fn(ReceivedMessage) -> impl Future` async
/// closure.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one decoded request.
    fn handle(&self, message: ReceivedMessage) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, message: ReceivedMessage) -> BoxFuture<'static, ()> {
        Box::pin(self(message))
    }
}

/// One received request on its way through the user handler.
///
/// Holds the correlation id to echo, the payload, and a weak handle to
/// the source connection — weak because the decoder never owns the
/// socket; the handle exists solely to route the reply, and a reply to a
/// connection that has since closed is a bad-argument error rather than a
/// resurrection.
///
/// Records are pooled; `server_send` returns them after submitting the
/// reply.
#[derive(Debug, Default)]
pub struct ReceivedMessage {
    correlation_id: u32,
    payload: Bytes,
    connection: Weak<Connection>,
    connection_id: ConnectionId,
}

impl ReceivedMessage {
    /// Fresh empty record for the pool factory.
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    /// Fill a pooled record for dispatch.
    pub(crate) fn prepare(
        &mut self,
        correlation_id: u32,
        payload: Bytes,
        connection: Weak<Connection>,
        connection_id: ConnectionId,
    ) {
        self.correlation_id = correlation_id;
        self.payload = payload;
        self.connection = connection;
        self.connection_id = connection_id;
    }

    /// Clear all fields; the pool runs this on release.
    pub(crate) fn clear(&mut self) {
        self.correlation_id = 0;
        self.payload = Bytes::new();
        self.connection = Weak::new();
        self.connection_id = 0;
    }

    /// Correlation id of the request; the reply echoes it unchanged.
    #[inline]
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// The request payload.
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Id of the connection the request arrived on.
    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Upgrade the connection handle, if the connection is still alive.
    pub(crate) fn connection(&self) -> Option<std::sync::Arc<Connection>> {
        self.connection.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn test_prepare_and_accessors() {
        let mut message = ReceivedMessage::empty();
        message.prepare(42, Bytes::from_static(b"payload"), Weak::new(), 3);

        assert_eq!(message.correlation_id(), 42);
        assert_eq!(&message.payload()[..], b"payload");
        assert_eq!(message.connection_id(), 3);
        assert!(message.connection().is_none()); // no live connection behind Weak::new()
    }

    #[test]
    fn test_pool_reset_clears_record() {
        let pool: Pool<ReceivedMessage> =
            Pool::with_reset(4, ReceivedMessage::empty, |m| m.clear());

        let mut message = pool.acquire();
        message.prepare(42, Bytes::from_static(b"payload"), Weak::new(), 3);
        pool.release(message);

        let message = pool.acquire();
        assert_eq!(message.correlation_id(), 0);
        assert!(message.payload().is_empty());
        assert_eq!(message.connection_id(), 0);
    }

    #[tokio::test]
    async fn test_closure_satisfies_handler_trait() {
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        let tx = std::sync::Mutex::new(Some(tx));

        let handler = move |message: ReceivedMessage| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(message.correlation_id());
                }
            }
        };

        let mut message = ReceivedMessage::empty();
        message.prepare(9, Bytes::new(), Weak::new(), 1);

        MessageHandler::handle(&handler, message).await;
        assert_eq!(rx.await.unwrap(), 9);
    }
}
