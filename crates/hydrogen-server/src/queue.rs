//! Outbound message queue of one connected peer.
//!
//! Every client connection and every driver owns one [`MsgQueue`]. The
//! router offers messages to it; a writer task pumps queued productions
//! into the transport. Backpressure is decided at offer time:
//!
//! - a blob offered while earlier blob bytes are still in flight, which
//!   would push them past `max_stream_bytes`, is dropped on its own
//! - a blob which would push the queue past `max_queue_bytes` is dropped
//!   on its own as well
//! - any other message which would push the queue past `max_queue_bytes`
//!   overflows it, and the peer is torn down

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::protocol::{AwaiterId, ContentState, Cursor, Msg, Requirements, SerializedMsg};
use crate::transport::PeerWrite;

static NEXT_AWAITER: AtomicU64 = AtomicU64::new(1);

/// Identity of the peer behind a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerKind {
    /// A client connection.
    Client,
    /// A local or remote driver.
    Driver {
        /// Driver name.
        name: String,
        /// Start generation; bumps on every restart.
        generation: u64,
        /// True for remote-broker proxies.
        remote: bool,
    },
}

impl PeerKind {
    pub fn is_driver(&self) -> bool {
        matches!(self, PeerKind::Driver { .. })
    }

    pub fn driver_name(&self) -> Option<&str> {
        match self {
            PeerKind::Driver { name, .. } => Some(name),
            PeerKind::Client => None,
        }
    }
}

/// Byte budgets of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_queue_bytes: usize,
    pub max_stream_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_queue_bytes: 128 * 1024 * 1024,
            max_stream_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Result of [`MsgQueue::offer`].
#[derive(Debug)]
pub enum Offer {
    /// Queued; the caller must `start()` the production once routing is done.
    Queued(Arc<SerializedMsg>),
    /// Blob dropped for this destination; the queue is unaffected.
    BlobDropped,
    /// The queue would exceed its budget and must be torn down.
    Overflow,
    /// The queue is already closed.
    Closed,
}

struct Entry {
    serialized: Arc<SerializedMsg>,
    cursor: Cursor,
    reserved: usize,
    blob: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    queued_bytes: usize,
    stream_bytes: usize,
    closed: bool,
}

/// Ordered outbound queue of one peer.
pub struct MsgQueue {
    awaiter: AwaiterId,
    label: String,
    kind: PeerKind,
    requirements: Requirements,
    limits: QueueLimits,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl MsgQueue {
    pub fn new(
        label: impl Into<String>,
        kind: PeerKind,
        requirements: Requirements,
        limits: QueueLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            awaiter: NEXT_AWAITER.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            kind,
            requirements,
            limits,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &PeerKind {
        &self.kind
    }

    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    /// Bytes reserved by queued messages not yet fully written.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    /// Portion of [`MsgQueue::queued_bytes`] belonging to blob messages.
    pub fn stream_bytes(&self) -> usize {
        self.state.lock().stream_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Messages still waiting to be written, head first.
    #[cfg(test)]
    pub(crate) fn pending_msgs(&self) -> Vec<Arc<Msg>> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|e| Arc::clone(e.serialized.msg()))
            .collect()
    }

    /// Applies the backpressure policy and enqueues `msg` if allowed.
    pub fn offer(&self, msg: &Arc<Msg>) -> Offer {
        let estimate = msg.estimated_size(self.requirements);
        let blob = msg.has_blobs();

        let mut state = self.state.lock();
        if state.closed {
            return Offer::Closed;
        }

        let over_queue = state.queued_bytes + estimate > self.limits.max_queue_bytes;
        if blob {
            let busy_stream = state.stream_bytes > 0
                && state.stream_bytes + estimate > self.limits.max_stream_bytes;
            if busy_stream || over_queue {
                trace!(
                    peer = %self.label,
                    queued_bytes = state.queued_bytes,
                    stream_bytes = state.stream_bytes,
                    estimate,
                    "Dropping blob for busy queue"
                );
                return Offer::BlobDropped;
            }
        } else if over_queue {
            return Offer::Overflow;
        }

        let serialized = msg.serialize(self.requirements);
        serialized.add_awaiter(self.awaiter);
        state.queued_bytes += estimate;
        if blob {
            state.stream_bytes += estimate;
        }
        state.pending.push_back(Entry {
            serialized: Arc::clone(&serialized),
            cursor: Cursor::default(),
            reserved: estimate,
            blob,
        });
        drop(state);

        self.wake.notify_one();
        Offer::Queued(serialized)
    }

    /// Closes the queue and detaches it from every pending production.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queued_bytes = 0;
            state.stream_bytes = 0;
            std::mem::take(&mut state.pending)
        };
        for entry in pending {
            entry.serialized.remove_awaiter(self.awaiter);
        }
        self.wake.notify_waiters();
        self.wake.notify_one();
    }

    /// Writes queued productions in order until the queue is closed or the
    /// transport fails.
    ///
    /// Descriptors are sent only with the first byte of a chunk, so a
    /// partial write never duplicates them.
    pub async fn pump(&self, writer: &mut dyn PeerWrite) -> io::Result<()> {
        loop {
            let wake = self.wake.notified();
            let head = {
                let state = self.state.lock();
                if state.closed {
                    return Ok(());
                }
                state
                    .pending
                    .front()
                    .map(|e| (Arc::clone(&e.serialized), e.cursor))
            };

            let Some((serialized, cursor)) = head else {
                wake.await;
                continue;
            };

            let progress = serialized.progress();
            match serialized.request_content(&cursor) {
                ContentState::Ready(chunk) => {
                    let data = &chunk.data[cursor.offset..];
                    let fds = if cursor.offset == 0 {
                        &chunk.fds[..]
                    } else {
                        &[]
                    };
                    let n = writer.write_chunk(data, fds).await?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero));
                    }
                    self.advance_head(&serialized, n);
                }
                ContentState::Pending => {
                    tokio::select! {
                        _ = progress => {}
                        _ = wake => {}
                    }
                }
                ContentState::Finished => self.finish_head(&serialized),
            }
        }
    }

    fn advance_head(&self, serialized: &Arc<SerializedMsg>, n: usize) {
        let mut state = self.state.lock();
        if let Some(entry) = state.pending.front_mut() {
            if Arc::ptr_eq(&entry.serialized, serialized) {
                serialized.advance(&mut entry.cursor, n);
            }
        }
    }

    fn finish_head(&self, serialized: &Arc<SerializedMsg>) {
        let entry = {
            let mut state = self.state.lock();
            match state.pending.front() {
                Some(e) if Arc::ptr_eq(&e.serialized, serialized) => {}
                _ => return,
            }
            let Some(entry) = state.pending.pop_front() else {
                return;
            };
            state.queued_bytes = state.queued_bytes.saturating_sub(entry.reserved);
            if entry.blob {
                state.stream_bytes = state.stream_bytes.saturating_sub(entry.reserved);
            }
            entry
        };
        entry.serialized.remove_awaiter(self.awaiter);
    }
}

impl fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgQueue")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("awaiter", &self.awaiter)
            .finish()
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        self.close();
    }
}
