//! Per-destination serialization of messages.
//!
//! A [`SerializedMsg`] turns one [`Msg`] into bytes for one requirement
//! set. Destinations register as awaiters and each keeps its own
//! [`Cursor`]; the production itself runs once, on the reactor for plain
//! messages and on the blocking pool when blobs must be encoded.
//!
//! ```text
//! PENDING --start()--> RUNNING --done--> TERMINATED
//!    |                    |
//!    | last awaiter gone  | last awaiter gone
//!    v                    v
//! TERMINATED          CANCELING --producer notices--> TERMINATED
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::blob::SharedBuffer;
use super::msg::Msg;
use super::xml::{escape, write_close_tag, write_open_tag, XmlElement};
use crate::error::Result;

/// Unique id of a consumer registered on productions.
pub type AwaiterId = u64;

/// What a destination can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Requirements {
    /// Destination accepts blob payloads as shared-memory descriptors.
    pub shared_buffers: bool,
}

impl Requirements {
    /// XML with base64 blobs.
    pub const INLINE: Self = Self {
        shared_buffers: false,
    };
    /// XML with blobs passed as descriptors.
    pub const SHARED: Self = Self {
        shared_buffers: true,
    };
}

/// Production state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationStatus {
    Pending,
    Running,
    Canceling,
    Terminated,
}

/// A contiguous piece of output.
///
/// Descriptors must travel with the first byte of `data`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    pub fds: Vec<Arc<SharedBuffer>>,
}

impl Chunk {
    fn plain(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            fds: Vec::new(),
        }
    }
}

/// Read position of one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub chunk: usize,
    pub offset: usize,
}

/// Answer to [`SerializedMsg::request_content`].
#[derive(Debug)]
pub enum ContentState {
    /// More bytes are available; the chunk is the one under the cursor.
    Ready(Chunk),
    /// Production has not reached the cursor yet.
    Pending,
    /// The cursor is past the end of the complete output.
    Finished,
}

struct Inner {
    status: SerializationStatus,
    awaiters: HashMap<AwaiterId, usize>,
    chunks: Vec<Chunk>,
    finished: bool,
    canceled: bool,
}

/// One production of a message for one requirement set.
pub struct SerializedMsg {
    msg: Arc<Msg>,
    requirements: Requirements,
    inner: Mutex<Inner>,
    progress: Notify,
}

impl SerializedMsg {
    pub(crate) fn new(msg: Arc<Msg>, requirements: Requirements) -> Self {
        Self {
            msg,
            requirements,
            inner: Mutex::new(Inner {
                status: SerializationStatus::Pending,
                awaiters: HashMap::new(),
                chunks: Vec::new(),
                finished: false,
                canceled: false,
            }),
            progress: Notify::new(),
        }
    }

    pub fn msg(&self) -> &Arc<Msg> {
        &self.msg
    }

    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    pub fn status(&self) -> SerializationStatus {
        self.inner.lock().status
    }

    pub fn awaiter_count(&self) -> usize {
        self.inner.lock().awaiters.len()
    }

    /// Returns true once all output has been produced (or production gave up).
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Returns true if production was abandoned because nobody wanted it.
    pub fn is_canceled(&self) -> bool {
        let inner = self.inner.lock();
        inner.canceled || inner.status == SerializationStatus::Canceling
    }

    /// Registers a destination.
    pub fn add_awaiter(&self, id: AwaiterId) {
        *self.inner.lock().awaiters.entry(id).or_insert(0) += 1;
    }

    /// Unregisters a destination, canceling the production if it was the
    /// last one.
    pub fn remove_awaiter(&self, id: AwaiterId) {
        let mut inner = self.inner.lock();
        match inner.awaiters.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return;
            }
            Some(_) => {
                inner.awaiters.remove(&id);
            }
            None => return,
        }
        if !inner.awaiters.is_empty() {
            return;
        }
        match inner.status {
            SerializationStatus::Pending => {
                inner.status = SerializationStatus::Terminated;
                inner.canceled = true;
                inner.finished = true;
            }
            SerializationStatus::Running => {
                inner.status = SerializationStatus::Canceling;
            }
            SerializationStatus::Canceling | SerializationStatus::Terminated => {}
        }
    }

    /// Starts production. Calling it again is a no-op.
    ///
    /// Messages with blobs are produced on the blocking pool when a runtime
    /// is available; everything else is rendered immediately.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.status != SerializationStatus::Pending {
                return;
            }
            inner.status = SerializationStatus::Running;
        }

        if self.msg.has_blobs() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let this = Arc::clone(self);
                handle.spawn_blocking(move || this.produce());
                return;
            }
        }
        self.produce();
    }

    /// Returns the chunk under `cursor`, if produced.
    pub fn request_content(&self, cursor: &Cursor) -> ContentState {
        let inner = self.inner.lock();
        match inner.chunks.get(cursor.chunk) {
            Some(chunk) => ContentState::Ready(chunk.clone()),
            None if inner.finished => ContentState::Finished,
            None => ContentState::Pending,
        }
    }

    /// Acknowledges `n` bytes written from the chunk under `cursor`.
    pub fn advance(&self, cursor: &mut Cursor, n: usize) {
        let len = {
            let inner = self.inner.lock();
            inner.chunks.get(cursor.chunk).map(|c| c.data.len())
        };
        let Some(len) = len else {
            return;
        };
        cursor.offset += n;
        if cursor.offset >= len {
            cursor.chunk += 1;
            cursor.offset = 0;
        }
    }

    /// Future resolving on the next production progress.
    ///
    /// Create it before calling [`SerializedMsg::request_content`] so no
    /// wakeup is missed.
    pub fn progress(&self) -> Notified<'_> {
        self.progress.notified()
    }

    /// Waits until production is complete.
    pub async fn wait_finished(&self) {
        loop {
            let notified = self.progress();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    fn produce(&self) {
        self.msg.note_production();
        let result = if self.requirements.shared_buffers && self.msg.has_blobs() {
            self.produce_shared()
        } else {
            self.produce_inline()
        };

        {
            let mut inner = self.inner.lock();
            if let Err(e) = result {
                warn!(msg = ?self.msg, error = %e, "Serialization failed, message dropped");
                inner.chunks.clear();
            }
            if inner.status == SerializationStatus::Canceling {
                debug!(msg = ?self.msg, "Serialization canceled");
                inner.chunks.clear();
                inner.canceled = true;
            }
            inner.status = SerializationStatus::Terminated;
            inner.finished = true;
        }
        self.progress.notify_waiters();
    }

    /// Appends a chunk; returns false if production should stop.
    fn publish(&self, chunk: Chunk) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.status == SerializationStatus::Canceling {
                return false;
            }
            if !chunk.data.is_empty() {
                inner.chunks.push(chunk);
            }
        }
        self.progress.notify_waiters();
        true
    }

    fn produce_inline(&self) -> Result<()> {
        let root = self.msg.root();
        if !self.msg.has_blobs() {
            self.publish(Chunk::plain(root.to_bytes()));
            return Ok(());
        }

        // Everything fallible happens before the first byte is published.
        let encoded = self
            .msg
            .blobs()
            .iter()
            .map(|b| b.base64())
            .collect::<Result<Vec<Bytes>>>()?;

        let mut head = Vec::with_capacity(256);
        write_open_tag(&mut head, &root.tag, &root.attrs);
        head.extend_from_slice(escape(&root.text).as_bytes());

        let mut blob_index = 0;
        for child in &root.children {
            let payload = match encoded.get(blob_index) {
                Some(payload) if child.tag == "oneBLOB" => payload,
                _ => {
                    child.write_to(&mut head);
                    continue;
                }
            };
            blob_index += 1;

            let mut attrs = child.attrs.clone();
            attrs.push(("enclen".to_string(), payload.len().to_string()));
            write_open_tag(&mut head, &child.tag, &attrs);
            head.push(b'\n');

            if !self.publish(Chunk::plain(std::mem::take(&mut head))) {
                return Ok(());
            }
            if !self.publish(Chunk::plain(payload.clone())) {
                return Ok(());
            }
            head.push(b'\n');
            write_close_tag(&mut head, &child.tag);
        }

        write_close_tag(&mut head, &root.tag);
        head.push(b'\n');
        self.publish(Chunk::plain(head));
        Ok(())
    }

    fn produce_shared(&self) -> Result<()> {
        let buffers = self
            .msg
            .blobs()
            .iter()
            .map(|b| b.shared_buffer())
            .collect::<Result<Vec<_>>>()?;

        let root = self.msg.root();
        let mut out = Vec::with_capacity(256);
        write_open_tag(&mut out, &root.tag, &root.attrs);
        out.extend_from_slice(escape(&root.text).as_bytes());

        let mut blob_index = 0;
        for child in &root.children {
            if child.tag == "oneBLOB" && blob_index < buffers.len() {
                blob_index += 1;
                let mut blob = XmlElement {
                    tag: child.tag.clone(),
                    attrs: child.attrs.clone(),
                    ..Default::default()
                };
                blob.set_attr("attached", "true");
                blob.write_to(&mut out);
            } else {
                child.write_to(&mut out);
            }
        }

        write_close_tag(&mut out, &root.tag);
        out.push(b'\n');
        self.publish(Chunk {
            data: Bytes::from(out),
            fds: buffers,
        });
        Ok(())
    }
}

impl fmt::Debug for SerializedMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SerializedMsg")
            .field("msg", &self.msg)
            .field("requirements", &self.requirements)
            .field("status", &inner.status)
            .field("awaiters", &inner.awaiters.len())
            .field("chunks", &inner.chunks.len())
            .finish()
    }
}
