//! Byte-chunk handoff between readers and the decode worker.
//!
//! Each OS receive lands in a pooled buffer; the reader wraps it in a
//! [`Chunk`] tagged with its source connection and enqueues it. A single
//! decode worker per role drains the queue, so the queue is the seam that
//! carries both data and end-of-stream notifications.
//!
//! The queue is bounded. When it fills, `enqueue` suspends the reader,
//! which therefore posts no further receive; the kernel socket buffer
//! fills next and TCP pushes back on the peer. That chain is the
//! transport's only flow control, and it drops nothing.

use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::error::{Result, TransportError};

/// Queue depth and buffer-pool prefill, per allowed connection.
pub const QUEUE_DEPTH_PER_CONNECTION: usize = 10;

/// One OS receive: a pooled buffer and how many of its bytes are valid.
///
/// Ownership of the buffer travels with the chunk; the decode worker
/// returns it to the buffer pool after the decoder has consumed it.
#[derive(Debug)]
pub struct Chunk {
    /// Connection the bytes arrived on.
    pub connection: ConnectionId,
    /// Pooled receive buffer.
    pub buffer: Vec<u8>,
    /// Number of valid bytes at the front of `buffer`.
    pub len: usize,
}

impl Chunk {
    /// The valid bytes of this chunk.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Give up the underlying buffer for release back to the pool.
    #[inline]
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Event flowing from a connection reader to the decode worker.
#[derive(Debug)]
pub enum ChunkEvent {
    /// Bytes received on a connection.
    Data(Chunk),
    /// The connection's receive side ended (EOF, error, or shutdown);
    /// the worker retires that connection's decoder state.
    Closed(ConnectionId),
}

/// Create the bounded chunk queue shared by a role's readers.
///
/// Returns the producer handle (cloned into each reader) and the single
/// consumer handle owned by the decode worker.
pub fn chunk_queue(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChunkSender { tx }, ChunkReceiver { rx })
}

/// Producer side of the chunk queue. Cheaply cloneable.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<ChunkEvent>,
}

impl ChunkSender {
    /// Enqueue an event, suspending while the queue is full.
    ///
    /// Errors only when the decode worker is gone (role shut down).
    pub async fn enqueue(&self, event: ChunkEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Consumer side of the chunk queue.
pub struct ChunkReceiver {
    rx: mpsc::Receiver<ChunkEvent>,
}

impl ChunkReceiver {
    /// Dequeue the next event, suspending while the queue is empty.
    ///
    /// Returns `None` when every sender is gone.
    pub async fn dequeue(&mut self) -> Option<ChunkEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn data_chunk(connection: ConnectionId, byte: u8) -> ChunkEvent {
        ChunkEvent::Data(Chunk {
            connection,
            buffer: vec![byte; 4],
            len: 4,
        })
    }

    #[tokio::test]
    async fn test_fifo_order_single_producer() {
        let (tx, mut rx) = chunk_queue(8);

        for b in 0u8..4 {
            tx.enqueue(data_chunk(1, b)).await.unwrap();
        }

        for b in 0u8..4 {
            match rx.dequeue().await.unwrap() {
                ChunkEvent::Data(chunk) => assert_eq!(chunk.bytes()[0], b),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_suspends_when_full() {
        let (tx, mut rx) = chunk_queue(1);
        tx.enqueue(data_chunk(1, 0)).await.unwrap();

        // Queue full: the next enqueue must not complete until a dequeue
        // makes room.
        let pending = tokio::time::timeout(Duration::from_millis(50), tx.enqueue(data_chunk(1, 1)));
        assert!(pending.await.is_err(), "enqueue completed on a full queue");

        let _ = rx.dequeue().await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), tx.enqueue(data_chunk(1, 2)))
            .await
            .expect("enqueue should proceed once the queue drains")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_event_carries_connection_id() {
        let (tx, mut rx) = chunk_queue(4);
        tx.enqueue(ChunkEvent::Closed(17)).await.unwrap();

        match rx.dequeue().await.unwrap() {
            ChunkEvent::Closed(id) => assert_eq!(id, 17),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dequeue_none_after_all_senders_dropped() {
        let (tx, mut rx) = chunk_queue(4);
        drop(tx);
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_receiver_dropped() {
        let (tx, rx) = chunk_queue(4);
        drop(rx);
        let result = tx.enqueue(data_chunk(1, 0)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[test]
    fn test_chunk_valid_bytes() {
        let chunk = Chunk {
            connection: 3,
            buffer: vec![1, 2, 3, 4, 5, 0, 0, 0],
            len: 5,
        };
        assert_eq!(chunk.bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(chunk.into_buffer().len(), 8);
    }
}
