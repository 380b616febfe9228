//! Transport listeners.
//!
//! Each accepted connection becomes a client queue handed to the broker
//! loop, which registers it owning nothing and watching nothing. TCP
//! clients get inline blobs; Unix clients get shared buffers.

mod fifo;
mod tcp;
mod unix;

pub use fifo::FifoListener;
pub use tcp::TcpServer;
pub use unix::UnixServer;

use std::time::Duration;

use crate::broker::{BrokerEvent, BrokerHandle};
use crate::protocol::Requirements;
use crate::queue::{MsgQueue, PeerKind, QueueLimits};
use crate::transport::PeerHalves;

/// Pause after a failed `accept` (descriptor exhaustion and the like).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What accept loops need to admit a connection.
#[derive(Debug, Clone)]
pub struct AcceptContext {
    pub handle: BrokerHandle,
    pub limits: QueueLimits,
}

impl AcceptContext {
    /// Hands a new client to the broker. Returns false once the broker is gone.
    async fn admit(&self, label: String, requirements: Requirements, halves: PeerHalves) -> bool {
        let queue = MsgQueue::new(label, PeerKind::Client, requirements, self.limits);
        self.handle
            .post(BrokerEvent::Connected { queue, halves })
            .await
    }
}
