//! Connection read loop and the decode worker.
//!
//! Each connection gets one [`read_loop`] task that owns the socket's
//! receive side: acquire a pooled buffer, read, hand the filled buffer to
//! the shared chunk queue, repeat. EOF, a receive error, role shutdown,
//! or a per-connection stop all end the loop, which then announces
//! end-of-stream through the queue.
//!
//! A single [`decode_loop`] task per role drains the queue. It keeps one
//! pooled [`FrameDecoder`] per connection id (chunks are tagged with
//! their source), releases every consumed buffer back to the pool, and
//! dispatches each decoded frame to the role's sink: the user handler on
//! the server, the response multiplexer on the client.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, trace, warn};

use crate::chunk::{Chunk, ChunkEvent, ChunkReceiver, ChunkSender};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::handler::{MessageHandler, ReceivedMessage};
use crate::multiplexer::ResponseMultiplexer;
use crate::pool::Pool;
use crate::protocol::{Frame, FrameDecoder};

/// Where a role's decoded frames go.
pub(crate) enum FrameSink {
    /// Server: wrap each frame in a pooled handoff record and run the
    /// user handler on the decode worker.
    Server {
        handler: Arc<dyn MessageHandler>,
        registry: Arc<ConnectionRegistry>,
        handoffs: Arc<Pool<ReceivedMessage>>,
    },
    /// Client: route each frame to its registered waiter. A protocol
    /// error here is fatal to the (single) connection, so the sink also
    /// carries the role's shutdown handle.
    Client {
        multiplexer: Arc<ResponseMultiplexer>,
        shutdown: Arc<watch::Sender<bool>>,
    },
}

/// Pump one connection's receive side into the chunk queue.
///
/// Exits on EOF, receive error, per-connection `stop`, role `shutdown`,
/// or a gone decode worker; always announces `Closed` on the way out so
/// the worker can retire this connection's decoder state. Cleanup owned
/// by the caller (counter, admission permit) is handled by RAII around
/// this future.
pub(crate) async fn read_loop<R>(
    connection_id: ConnectionId,
    mut read_half: R,
    buffers: Arc<Pool<Vec<u8>>>,
    chunks: ChunkSender,
    mut shutdown: watch::Receiver<bool>,
    stop: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buffer = buffers.acquire();

        let read = tokio::select! {
            read = read_half.read(&mut buffer) => read,
            _ = stop.notified() => {
                buffers.release(buffer);
                debug!(connection_id, "reader stopped");
                break;
            }
            _ = shutdown.changed() => {
                buffers.release(buffer);
                debug!(connection_id, "reader shut down");
                break;
            }
        };

        match read {
            Ok(0) => {
                buffers.release(buffer);
                debug!(connection_id, "peer closed connection");
                break;
            }
            Ok(len) => {
                trace!(connection_id, len, "received chunk");
                // Ownership of the buffer moves to the decode worker. If
                // the queue is full this suspends, which is the
                // back-pressure edge: no new receive is posted until the
                // decoder catches up.
                let chunk = Chunk {
                    connection: connection_id,
                    buffer,
                    len,
                };
                if chunks.enqueue(ChunkEvent::Data(chunk)).await.is_err() {
                    debug!(connection_id, "decode worker gone, reader exiting");
                    return;
                }
            }
            Err(e) => {
                buffers.release(buffer);
                error!(connection_id, error = %e, "receive failed");
                break;
            }
        }
    }

    let _ = chunks.enqueue(ChunkEvent::Closed(connection_id)).await;
}

/// Drain the chunk queue, decode, dispatch.
///
/// Runs until every reader's sender is gone (role shutdown). Frames from
/// one chunk are all dispatched before the next chunk is dequeued.
pub(crate) async fn decode_loop(
    mut chunks: ChunkReceiver,
    decoders: Arc<Pool<FrameDecoder>>,
    buffers: Arc<Pool<Vec<u8>>>,
    sink: FrameSink,
) {
    let mut states: HashMap<ConnectionId, FrameDecoder> = HashMap::new();

    while let Some(event) = chunks.dequeue().await {
        match event {
            ChunkEvent::Data(chunk) => {
                let connection_id = chunk.connection;
                let decoder = states
                    .entry(connection_id)
                    .or_insert_with(|| decoders.acquire());

                let decoded = decoder.push(chunk.bytes());
                buffers.release(chunk.into_buffer());

                match decoded {
                    Ok(frames) => {
                        for frame in frames {
                            dispatch(&sink, connection_id, frame).await;
                        }
                    }
                    Err(e) => {
                        error!(connection_id, error = %e, "stream desynchronized");
                        if let Some(state) = states.remove(&connection_id) {
                            decoders.release(state);
                        }
                        match &sink {
                            FrameSink::Server { registry, .. } => {
                                // Only this connection is torn down; the
                                // rest keep decoding.
                                registry.stop_connection(connection_id);
                            }
                            FrameSink::Client {
                                multiplexer,
                                shutdown,
                            } => {
                                multiplexer.cancel_all();
                                let _ = shutdown.send(true);
                                break;
                            }
                        }
                    }
                }
            }
            ChunkEvent::Closed(connection_id) => {
                if let Some(state) = states.remove(&connection_id) {
                    if !state.is_idle() {
                        warn!(connection_id, "connection closed mid-frame");
                    }
                    decoders.release(state);
                }
                if let FrameSink::Client {
                    multiplexer,
                    shutdown,
                } = &sink
                {
                    // The client role has exactly one connection; without
                    // it no reply can ever arrive.
                    multiplexer.cancel_all();
                    let _ = shutdown.send(true);
                }
            }
        }
    }

    // Retire whatever states remain when the role winds down.
    for (_, state) in states.drain() {
        decoders.release(state);
    }
}

async fn dispatch(sink: &FrameSink, connection_id: ConnectionId, frame: Frame) {
    match sink {
        FrameSink::Server {
            handler,
            registry,
            handoffs,
        } => {
            let Some(connection) = registry.connection(connection_id) else {
                warn!(connection_id, "message from already-removed connection dropped");
                return;
            };
            let mut record = handoffs.acquire();
            record.prepare(
                frame.correlation_id,
                frame.payload,
                Arc::downgrade(&connection),
                connection_id,
            );
            handler.handle(record).await;
        }
        FrameSink::Client { multiplexer, .. } => {
            multiplexer.signal(frame.correlation_id, frame.payload);
        }
    }
}
