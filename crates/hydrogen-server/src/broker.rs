//! The broker loop.
//!
//! A single task owns the [`Router`] and the [`DriverManager`]. Connection
//! tasks, timers and listeners talk to it only through [`BrokerEvent`]s, so
//! routing decisions are never made concurrently.

use std::sync::Arc;

use hydrogen_common::ExitOutcome;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{AdminCommand, AdminEvent};
use crate::driver::{DriverManager, DriverSettings, DriverSpec, DriverState};
use crate::error::{Result, ServerError};
use crate::peer::{self, PeerContext};
use crate::protocol::Msg;
use crate::queue::MsgQueue;
use crate::router::{Dispatch, QueueId, Router};
use crate::transport::PeerHalves;

const EVENT_CAPACITY: usize = 1024;
const ADMIN_CAPACITY: usize = 64;

/// Input to the broker loop.
pub enum BrokerEvent {
    /// A client connection was accepted.
    Connected {
        queue: Arc<MsgQueue>,
        halves: PeerHalves,
    },
    /// A peer sent a message.
    Inbound { from: QueueId, msg: Arc<Msg> },
    /// A peer's connection ended or became unusable.
    Closed { id: QueueId, reason: String },
    /// A local driver process ended.
    DriverExited {
        name: String,
        generation: u64,
        outcome: ExitOutcome,
    },
    /// A driver did not speak within the handshake timeout.
    HandshakeTimeout { name: String, generation: u64 },
    /// The restart delay of a driver elapsed.
    RestartDue { name: String, generation: u64 },
    /// A remote proxy connected.
    RemoteConnected {
        name: String,
        generation: u64,
        stream: TcpStream,
    },
    /// A remote proxy failed to connect.
    RemoteFailed {
        name: String,
        generation: u64,
        reason: String,
    },
    /// Operator command.
    Admin(AdminCommand),
}

/// Cloneable entry point into a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    events: mpsc::Sender<BrokerEvent>,
    admin: broadcast::Sender<AdminEvent>,
}

impl BrokerHandle {
    /// Creates a handle and the receiving end of its event channel.
    pub fn channel() -> (Self, mpsc::Receiver<BrokerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let (admin, _) = broadcast::channel(ADMIN_CAPACITY);
        (Self { events, admin }, rx)
    }

    /// Sends an event to the loop. Returns false once the broker is gone.
    pub async fn post(&self, event: BrokerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Submits an administrative command.
    pub async fn command(&self, command: AdminCommand) -> bool {
        self.post(BrokerEvent::Admin(command)).await
    }

    /// Subscribes to the operator channel.
    pub fn subscribe(&self) -> broadcast::Receiver<AdminEvent> {
        self.admin.subscribe()
    }

    pub(crate) fn publish(&self, event: AdminEvent) {
        // No subscribers is fine.
        let _ = self.admin.send(event);
    }
}

/// Router plus driver manager, driven by [`BrokerEvent`]s.
pub struct Broker {
    router: Router,
    drivers: DriverManager,
    handle: BrokerHandle,
    events: mpsc::Receiver<BrokerEvent>,
    max_element_bytes: usize,
}

impl Broker {
    pub fn new(max_clients: usize, settings: DriverSettings) -> Self {
        let (handle, events) = BrokerHandle::channel();
        let max_element_bytes = settings.max_element_bytes;
        Self {
            router: Router::new(max_clients),
            drivers: DriverManager::new(settings, handle.clone()),
            handle,
            events,
            max_element_bytes,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn driver_state(&self, name: &str) -> Option<DriverState> {
        self.drivers.state(name)
    }

    /// Starts a driver before the loop runs.
    pub fn start_driver(&mut self, spec: DriverSpec) -> Result<()> {
        let dispatch = self.drivers.start(spec, &mut self.router)?;
        self.settle(dispatch);
        Ok(())
    }

    /// Runs until `shutdown` is cancelled, then stops every driver and
    /// disconnects every peer.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(drivers = self.drivers.names().len(), "Broker running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        info!("Broker shutting down");
        self.drivers.stop_all(&mut self.router);
        for id in self.router.peer_ids() {
            self.router.detach(id);
        }
    }

    fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected { queue, halves } => self.connect(queue, halves),
            BrokerEvent::Inbound { from, msg } => self.inbound(from, &msg),
            BrokerEvent::Closed { id, reason } => {
                if let Some(queue) = self.router.queue(id) {
                    info!(peer = %queue.label(), %reason, "Peer disconnected");
                }
                self.teardown(id);
            }
            BrokerEvent::DriverExited {
                name,
                generation,
                outcome,
            } => {
                let dispatch = self
                    .drivers
                    .on_exit(&name, generation, outcome, &mut self.router);
                self.settle(dispatch);
            }
            BrokerEvent::HandshakeTimeout { name, generation } => {
                self.drivers.on_handshake_timeout(&name, generation);
            }
            BrokerEvent::RestartDue { name, generation } => {
                match self
                    .drivers
                    .on_restart_due(&name, generation, &mut self.router)
                {
                    Ok(dispatch) => self.settle(dispatch),
                    Err(e) => warn!(driver = %name, error = %e, "Driver restart failed"),
                }
            }
            BrokerEvent::RemoteConnected {
                name,
                generation,
                stream,
            } => match self
                .drivers
                .on_remote_connected(&name, generation, stream, &mut self.router)
            {
                Ok(dispatch) => self.settle(dispatch),
                Err(e) => warn!(driver = %name, error = %e, "Remote attach failed"),
            },
            BrokerEvent::RemoteFailed {
                name,
                generation,
                reason,
            } => self.drivers.on_remote_failed(&name, generation, &reason),
            BrokerEvent::Admin(command) => self.admin(command),
        }
    }

    fn connect(&mut self, queue: Arc<MsgQueue>, halves: PeerHalves) {
        match self.router.attach(Arc::clone(&queue), None) {
            Ok((id, heartbeat)) => {
                info!(peer = %queue.label(), id = %id, "Client connected");
                peer::spawn(
                    &self.handle,
                    PeerContext {
                        id,
                        heartbeat,
                        queue,
                        device_filter: None,
                        max_element_bytes: self.max_element_bytes,
                    },
                    halves,
                );
            }
            Err(e) => {
                warn!(peer = %queue.label(), error = %e, "Rejecting connection");
                queue.close();
            }
        }
    }

    fn inbound(&mut self, from: QueueId, msg: &Arc<Msg>) {
        if !self.router.contains(from) {
            return;
        }
        self.drivers.on_activity(from);

        match self.router.dispatch(from, msg) {
            Ok(dispatch) => {
                debug!(
                    kind = ?msg.kind(),
                    device = ?msg.device(),
                    delivered = dispatch.delivered,
                    withheld = dispatch.withheld,
                    dropped_blobs = dispatch.dropped_blobs,
                    "Routed"
                );
                self.settle(dispatch);
            }
            Err(e) if !e.is_fatal() => {
                let peer = self.router.queue(from).map(|q| q.label().to_owned());
                warn!(peer = ?peer, error = %e, "Message rejected");
            }
            Err(e) => {
                warn!(error = %e, "Dropping peer");
                self.teardown(from);
            }
        }
    }

    fn admin(&mut self, command: AdminCommand) {
        info!(command = %command, "Admin command");
        let result = match &command {
            AdminCommand::Start(spec) => self.drivers.start(spec.clone(), &mut self.router),
            AdminCommand::Stop { target, name } => {
                self.drivers
                    .stop(target, name.as_deref(), &mut self.router)
            }
            AdminCommand::Snoop {
                driver,
                device,
                property,
            } => self.driver_peer(driver).map(|id| {
                self.router.add_snoop(id, device, property.as_deref())
            }),
            AdminCommand::Unsnoop {
                driver,
                device,
                property,
            } => self.driver_peer(driver).map(|id| {
                self.router.remove_snoop(id, device, property.as_deref());
                Dispatch::default()
            }),
        };

        match result {
            Ok(dispatch) => self.settle(dispatch),
            Err(e) => {
                warn!(command = %command, error = %e, "Admin command failed");
                self.handle.publish(AdminEvent::CommandRejected {
                    line: command.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn driver_peer(&self, driver: &str) -> Result<QueueId> {
        self.drivers
            .peer_of(driver)
            .ok_or_else(|| ServerError::driver(driver, "not connected"))
    }

    /// Removes a peer, letting the driver manager react if it was a driver.
    fn teardown(&mut self, id: QueueId) {
        let dispatch = self.detach(id);
        self.settle(dispatch);
    }

    fn detach(&mut self, id: QueueId) -> Dispatch {
        match self.drivers.on_peer_closed(id, &mut self.router) {
            Some(dispatch) => dispatch,
            None => self.router.detach(id),
        }
    }

    /// Tears down every queue that overflowed, including queues that
    /// overflow because of the withdrawals those teardowns emit.
    fn settle(&mut self, dispatch: Dispatch) {
        let mut overflowed = dispatch.overflowed;
        while let Some(id) = overflowed.pop() {
            if let Some(queue) = self.router.queue(id) {
                let err = ServerError::Overflow {
                    peer: queue.label().to_owned(),
                    queued: queue.queued_bytes(),
                };
                warn!(error = %err, "Dropping peer");
            }
            overflowed.extend(self.detach(id).overflowed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Requirements;
    use crate::queue::{PeerKind, QueueLimits};
    use crate::transport::split_unix;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    async fn connect(handle: &BrokerHandle, label: &str) -> UnixStream {
        connect_as(handle, label, PeerKind::Client).await
    }

    async fn connect_as(handle: &BrokerHandle, label: &str, kind: PeerKind) -> UnixStream {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let queue = MsgQueue::new(label, kind, Requirements::INLINE, QueueLimits::default());
        assert!(
            handle
                .post(BrokerEvent::Connected {
                    queue,
                    halves: split_unix(ours),
                })
                .await
        );
        theirs
    }

    async fn read_until(stream: &mut UnixStream, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed before {needle:?}");
                seen.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    break;
                }
            }
        })
        .await
        .unwrap();
        String::from_utf8(seen).unwrap()
    }

    #[tokio::test]
    async fn test_clients_exchange_through_broker() {
        let broker = Broker::new(8, DriverSettings::default());
        let handle = broker.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broker.run(shutdown.clone()));

        let driver = PeerKind::Driver {
            name: "sim".into(),
            generation: 1,
            remote: false,
        };
        let mut sim = connect_as(&handle, "sim", driver).await;
        let mut client = connect(&handle, "client").await;

        client
            .write_all(b"<getProperties version=\"1.7\"/>")
            .await
            .unwrap();
        // Let the subscription land before the driver speaks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        sim.write_all(b"<defNumberVector device=\"Cam\" name=\"TEMP\"/>")
            .await
            .unwrap();
        sim.write_all(b"<message message=\"hello\"/>").await.unwrap();

        let text = read_until(&mut client, "hello").await;
        assert!(text.starts_with("<defNumberVector device=\"Cam\" name=\"TEMP\""));

        shutdown.cancel();
        task.await.unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_rejected_admin_command_is_published() {
        let broker = Broker::new(8, DriverSettings::default());
        let handle = broker.handle();
        let mut admin = handle.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broker.run(shutdown.clone()));

        handle
            .command(AdminCommand::Snoop {
                driver: "indi_missing".into(),
                device: "Cam".into(),
                property: None,
            })
            .await;

        let event = tokio::time::timeout(Duration::from_secs(5), admin.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            AdminEvent::CommandRejected { line, reason } => {
                assert_eq!(line, "snoop indi_missing \"Cam\"");
                assert!(reason.contains("not connected"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let broker = Broker::new(1, DriverSettings::default());
        let handle = broker.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broker.run(shutdown.clone()));

        let _first = connect(&handle, "first").await;
        let mut second = connect(&handle, "second").await;

        // Refused connections are closed without a word.
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
