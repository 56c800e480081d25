//! Response multiplexing for the client role.
//!
//! One connection, many concurrent callers. Each caller registers its
//! correlation id before the request goes out, then parks on a
//! [`ReplyLatch`] until the reader signals its reply. Replies may arrive
//! in any order; the id, not arrival order, routes each one.
//!
//! The id → waiter table sits behind a reader/writer lock: `register` and
//! `unregister` take the write side, `signal` and the `wait` lookup take
//! the read side, so concurrent lookups never serialize against each
//! other. Latches are pooled and reset between registrations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{Result, TransportError};
use crate::pool::Pool;

/// What a waiter wakes up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    /// The correlated response payload.
    Payload(Bytes),
    /// The transport closed before the response arrived.
    Canceled,
}

/// Reusable one-shot latch with a single-slot inbox.
///
/// `try_set` stores the reply and wakes the waiter; only the first set per
/// registration wins. `reset` (run by the pool's release hook) clears the
/// inbox so the latch can serve a new registration. The wait loop
/// re-checks the inbox after every wakeup, so a stale wakeup permit left
/// by an earlier life is harmless.
pub(crate) struct ReplyLatch {
    notify: Notify,
    inbox: Mutex<Option<Reply>>,
}

impl ReplyLatch {
    pub fn new() -> Self {
        Self {
            notify: Notify::new(),
            inbox: Mutex::new(None),
        }
    }

    /// Store the reply and wake the waiter. Returns false if a reply is
    /// already stored (the signal loses and the caller should log it).
    pub fn try_set(&self, reply: Reply) -> bool {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        if inbox.is_some() {
            return false;
        }
        *inbox = Some(reply);
        drop(inbox);
        self.notify.notify_one();
        true
    }

    /// Park until a reply is stored, then take it.
    pub async fn wait(&self) -> Reply {
        loop {
            // Arm the wakeup before checking the inbox; a signal landing
            // between the check and the await still gets observed.
            let notified = self.notify.notified();
            if let Some(reply) = self
                .inbox
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                return reply;
            }
            notified.await;
        }
    }

    /// Clear the inbox for the next registration.
    pub fn reset(&self) {
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

/// Correlation id → waiter table shared by all caller tasks and the
/// client reader.
///
/// Once canceled (close, fatal protocol error), the table stays canceled:
/// `register` refuses new ids, so no waiter can slip in after
/// `cancel_all` drained the table and end up with nothing left to signal
/// it. The flag is only ever touched under the table's write lock, which
/// is what makes register-vs-cancel atomic.
pub(crate) struct ResponseMultiplexer {
    waiters: RwLock<HashMap<u32, Arc<ReplyLatch>>>,
    latches: Pool<Arc<ReplyLatch>>,
    canceled: AtomicBool,
}

impl ResponseMultiplexer {
    pub fn new(latch_pool_capacity: usize) -> Self {
        Self {
            waiters: RwLock::new(HashMap::new()),
            latches: Pool::with_reset(
                latch_pool_capacity,
                || Arc::new(ReplyLatch::new()),
                |latch| latch.reset(),
            ),
            canceled: AtomicBool::new(false),
        }
    }

    /// Register a caller's correlation id before its request is written.
    ///
    /// Fails with [`TransportError::Canceled`] once `cancel_all` has run;
    /// the check happens under the same write lock `cancel_all` takes, so
    /// a registration either lands before the drain (and gets canceled
    /// with the rest) or is refused.
    ///
    /// A collision means two concurrently outstanding requests picked the
    /// same id — a caller bug, surfaced as a protocol error distinct from
    /// ordinary I/O failures.
    pub fn register(&self, id: u32) -> Result<()> {
        let mut waiters = self.waiters.write().unwrap_or_else(|e| e.into_inner());
        if self.canceled.load(Ordering::SeqCst) {
            return Err(TransportError::Canceled);
        }
        if waiters.contains_key(&id) {
            return Err(TransportError::Protocol(format!(
                "correlation id {} is already registered",
                id
            )));
        }
        waiters.insert(id, self.latches.acquire());
        Ok(())
    }

    /// Deliver a response payload to the waiter registered under `id`.
    ///
    /// A missing id means the caller already unregistered (late reply);
    /// the payload is logged and discarded. The set happens under the
    /// read lock so a concurrent unregister cannot recycle the latch
    /// mid-signal.
    pub fn signal(&self, id: u32, payload: Bytes) {
        let waiters = self.waiters.read().unwrap_or_else(|e| e.into_inner());
        match waiters.get(&id) {
            Some(latch) => {
                if !latch.try_set(Reply::Payload(payload)) {
                    warn!(correlation_id = id, "duplicate reply dropped");
                }
            }
            None => {
                warn!(correlation_id = id, "late reply for unknown correlation id dropped");
            }
        }
    }

    /// Park until the reply registered under `id` arrives, then
    /// unregister and return it.
    pub async fn wait(&self, id: u32) -> Result<Bytes> {
        let latch = {
            let waiters = self.waiters.read().unwrap_or_else(|e| e.into_inner());
            waiters.get(&id).cloned()
        };
        let latch = latch.ok_or_else(|| {
            TransportError::Protocol(format!("correlation id {} is not registered", id))
        })?;

        let reply = latch.wait().await;
        self.unregister(id);

        match reply {
            Reply::Payload(payload) => Ok(payload),
            Reply::Canceled => Err(TransportError::Canceled),
        }
    }

    /// Remove `id` from the table and return its latch to the pool.
    pub fn unregister(&self, id: u32) {
        let removed = {
            let mut waiters = self.waiters.write().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&id)
        };
        if let Some(latch) = removed {
            self.latches.release(latch);
        }
    }

    /// Wake every outstanding waiter with a canceled reply and refuse
    /// all future registrations.
    ///
    /// Called on close and on fatal protocol errors; no waiter is left
    /// stranded, including one racing in through `register` — the
    /// canceled flag is set under the write lock before the drain, so a
    /// registration lands either in the drain or in `register`'s
    /// rejection. The drained latches are not pooled — their waiters
    /// still hold them until they observe the cancellation.
    pub fn cancel_all(&self) {
        let drained: Vec<(u32, Arc<ReplyLatch>)> = {
            let mut waiters = self.waiters.write().unwrap_or_else(|e| e.into_inner());
            self.canceled.store(true, Ordering::SeqCst);
            waiters.drain().collect()
        };
        for (id, latch) in drained {
            if !latch.try_set(Reply::Canceled) {
                warn!(correlation_id = id, "waiter already signaled during cancel");
            }
        }
    }

    /// Number of registrations still awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.waiters.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
