//! Pending-request table: correlates responses from the peer to the
//! outbound requests that are waiting for them.
//!
//! The outbound path registers an entry *before* sending so a fast reply
//! cannot race the insert. Each entry is completed at most once: a response
//! removes it atomically, a duplicate finds nothing. When the connection
//! closes every remaining waiter receives [`RequestError::ConnectionClosed`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use duplex_core::{RequestError, Response};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

type PendingTx = oneshot::Sender<Result<Response, RequestError>>;

#[derive(Default)]
struct Entries {
    waiters: HashMap<u64, PendingTx>,
    closed: bool,
}

/// Concurrent map from request id to a single-assignment response slot.
pub struct PendingRequests {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
}

impl PendingRequests {
    /// Create an empty, open table. Ids start at 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Entries::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate an unused id and register a waiter for it.
    pub fn register(self: &Arc<Self>) -> Result<PendingResponse, RequestError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(RequestError::ConnectionClosed);
        }
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !entries.waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        let _ = entries.waiters.insert(id, tx);
        drop(entries);

        Ok(PendingResponse {
            id,
            rx,
            table: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Fulfil the waiter for `response.request_id`.
    ///
    /// Returns `false` for unknown, late or duplicate ids.
    pub fn complete(&self, response: Response) -> bool {
        let waiter = self.entries.lock().waiters.remove(&response.request_id);
        match waiter {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    debug!("response arrived after the caller stopped waiting");
                }
                true
            }
            None => false,
        }
    }

    /// Remove a waiter without fulfilling it.
    pub fn cancel(&self, id: u64) -> bool {
        self.entries.lock().waiters.remove(&id).is_some()
    }

    /// Fail every waiter with [`RequestError::ConnectionClosed`] and refuse
    /// further registrations. Returns how many waiters were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingTx> = {
            let mut entries = self.entries.lock();
            entries.closed = true;
            entries.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RequestError::ConnectionClosed));
        }
        count
    }

    /// Number of live waiters.
    pub fn len(&self) -> usize {
        self.entries.lock().waiters.len()
    }

    /// Whether no waiters are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }
}

/// The caller's half of a pending request.
///
/// Resolves exactly once. Dropping it before it resolves removes the table
/// entry, so abandoned requests do not accumulate.
#[must_use = "dropping a PendingResponse cancels the request"]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<Response, RequestError>>,
    table: Weak<PendingRequests>,
    finished: bool,
}

impl PendingResponse {
    /// The request id this response is correlated by.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop waiting and free the table entry.
    ///
    /// Returns `false` if the entry was already gone.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        self.table.upgrade().is_some_and(|table| table.cancel(self.id))
    }

    /// Wait at most `timeout`; on expiry the entry is freed.
    pub async fn with_timeout(self, timeout: Duration) -> Result<Response, RequestError> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(RequestError::Timeout(timeout)))
    }
}

impl Future for PendingResponse {
    type Output = Result<Response, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or(Err(RequestError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(table) = self.table.upgrade() {
                let _ = table.cancel(self.id);
            }
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
