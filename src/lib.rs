//! # cachewire
//!
//! Dual-role TCP transport for a distributed cache's client/server
//! communication: framed, length-prefixed, request-multiplexed.
//!
//! One [`CacheTransport`] can operate either as a **server** (accepting
//! many client connections and dispatching decoded messages to a user
//! handler) or as a **client** (one connection shared by many concurrent
//! caller tasks, each awaiting its own correlated reply).
//!
//! ## Architecture
//!
//! - **Framing**: 8-byte little-endian header (total length + correlation
//!   id) followed by an opaque payload; the [`protocol`] module
//!   reassembles frames from arbitrarily chunked reads.
//! - **Multiplexing**: replies are matched to callers by correlation id
//!   over a single shared connection, in any arrival order.
//! - **Pooling**: receive buffers, decoder states, reply latches, and
//!   handoff records are recycled through bounded [`pool::Pool`]s to keep
//!   the hot path allocation-free.
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use cachewire::{CacheTransport, ReceivedMessage};
//!
//! #[tokio::main]
//! async fn main() -> cachewire::Result<()> {
//!     let server = CacheTransport::new(4096, 64)?;
//!     let reply_via = server.clone();
//!     server
//!         .listen("127.0.0.1:7600".parse().unwrap(), move |message: ReceivedMessage| {
//!             let transport = reply_via.clone();
//!             async move {
//!                 let echoed = message.payload().clone();
//!                 let _ = transport.server_send(echoed, message).await;
//!             }
//!         })
//!         .await?;
//!
//!     let client = CacheTransport::new(4096, 1)?;
//!     client.connect("127.0.0.1:7600".parse().unwrap()).await?;
//!     let id = client.client_send(Bytes::from_static(b"hello"), true).await?;
//!     let reply = client.client_receive(id).await?;
//!     assert_eq!(&reply[..], b"hello");
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod connection;
pub mod error;
pub mod handler;
pub mod pool;
pub mod protocol;

mod acceptor;
mod multiplexer;
mod reader;
mod transport;

pub use connection::ConnectionId;
pub use error::{Result, TransportError};
pub use handler::{BoxFuture, MessageHandler, ReceivedMessage};
pub use transport::{CacheTransport, MIN_BUFFER_SIZE};
