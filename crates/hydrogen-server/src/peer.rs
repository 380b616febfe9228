//! Per-connection reader and writer tasks.
//!
//! The reader turns bytes into messages and forwards them to the broker
//! loop. The writer drains the peer's [`MsgQueue`]. Neither touches the
//! routing table; a peer that has been detached is recognised through its
//! [`Heartbeat`].

use std::collections::VecDeque;
use std::sync::Arc;

use hydrogen_common::Heartbeat;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{BrokerEvent, BrokerHandle};
use crate::protocol::{Msg, XmlParser};
use crate::queue::MsgQueue;
use crate::router::QueueId;
use crate::transport::{PeerHalves, PeerRead, PeerWrite};

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// What the peer tasks need to know about their connection.
#[derive(Debug)]
pub struct PeerContext {
    pub id: QueueId,
    pub heartbeat: Heartbeat,
    pub queue: Arc<MsgQueue>,
    /// Inbound messages about other devices are dropped.
    pub device_filter: Option<String>,
    pub max_element_bytes: usize,
}

/// Spawns the reader and writer tasks of one connection.
pub fn spawn(handle: &BrokerHandle, ctx: PeerContext, halves: PeerHalves) {
    let (reader, writer) = halves;
    let done = CancellationToken::new();
    let label = ctx.queue.label().to_string();

    tokio::spawn(write_loop(
        handle.clone(),
        ctx.id,
        Arc::clone(&ctx.queue),
        writer,
        done.clone(),
    ));
    tokio::spawn(read_loop(handle.clone(), ctx, label, reader, done));
}

async fn read_loop(
    handle: BrokerHandle,
    ctx: PeerContext,
    label: String,
    mut reader: Box<dyn PeerRead>,
    done: CancellationToken,
) {
    let mut parser = XmlParser::new(ctx.max_element_bytes);
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    let mut fds = VecDeque::new();

    let reason = 'read: loop {
        let n = tokio::select! {
            result = reader.read_chunk(&mut buf, &mut fds) => match result {
                Ok(0) => break 'read "end of stream".to_string(),
                Ok(n) => n,
                Err(e) => break 'read format!("read failed: {e}"),
            },
            _ = done.cancelled() => return,
        };

        let elements = match parser.feed(&buf[..n]) {
            Ok(elements) => elements,
            Err(e) => break 'read e.to_string(),
        };

        for element in elements {
            let msg = match Msg::from_element(element, &mut fds) {
                Ok(msg) => msg,
                Err(e) if e.is_fatal() => break 'read e.to_string(),
                Err(e) => {
                    warn!(peer = %label, error = %e, "Discarding message");
                    continue;
                }
            };

            if let (Some(filter), Some(device)) = (ctx.device_filter.as_deref(), msg.device()) {
                if filter != device {
                    debug!(peer = %label, device, "Dropping message for unselected device");
                    continue;
                }
            }

            if !ctx.heartbeat.alive() {
                return;
            }
            if !handle
                .post(BrokerEvent::Inbound { from: ctx.id, msg })
                .await
            {
                return;
            }
        }

        if parser.is_idle() && !fds.is_empty() {
            debug!(peer = %label, count = fds.len(), "Closing unclaimed descriptors");
            fds.clear();
        }
    };

    if ctx.heartbeat.alive() {
        handle
            .post(BrokerEvent::Closed {
                id: ctx.id,
                reason,
            })
            .await;
    }
}

async fn write_loop(
    handle: BrokerHandle,
    id: QueueId,
    queue: Arc<MsgQueue>,
    mut writer: Box<dyn PeerWrite>,
    done: CancellationToken,
) {
    let result = queue.pump(writer.as_mut()).await;
    done.cancel();

    match result {
        Ok(()) => {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %queue.label(), error = %e, "Shutdown failed");
            }
        }
        Err(e) => {
            if !queue.is_closed() {
                handle
                    .post(BrokerEvent::Closed {
                        id,
                        reason: format!("write failed: {e}"),
                    })
                    .await;
            }
        }
    }
}
