//! Driver lifecycle management.
//!
//! Each driver is either a local child process talking over a Unix socket
//! pair or a proxy connection to another broker. Both follow the same state
//! machine:
//!
//! ```text
//! STOPPED -> STARTING -> RUNNING -> EXITED|CRASHED -> RESTARTING -> STARTING
//!                                                  \-> STOPPED
//! ```
//!
//! Every asynchronous completion (exit, handshake timeout, restart delay,
//! remote connect) is tagged with the launch generation, so events from an
//! earlier incarnation are ignored.

mod local;
mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydrogen_common::{ChildProcess, ExitOutcome, RestartDecision, RestartWindow};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

use crate::admin::AdminEvent;
use crate::broker::{BrokerEvent, BrokerHandle};
use crate::error::{Result, ServerError};
use crate::peer::{self, PeerContext};
use crate::protocol::{Msg, Requirements};
use crate::queue::{MsgQueue, PeerKind, QueueLimits};
use crate::router::{Dispatch, QueueId, Router};
use crate::transport::{split_tcp, split_unix};

/// Port used when a remote target omits one.
pub const DEFAULT_PORT: u16 = 7624;

/// Lifecycle state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    Stopped,
    Starting,
    Running,
    Exited,
    Crashed,
    Restarting,
}

impl DriverState {
    /// True while the driver occupies its name (anything but STOPPED).
    pub fn is_active(&self) -> bool {
        !matches!(self, DriverState::Stopped)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::Stopped => "STOPPED",
            DriverState::Starting => "STARTING",
            DriverState::Running => "RUNNING",
            DriverState::Exited => "EXITED",
            DriverState::Crashed => "CRASHED",
            DriverState::Restarting => "RESTARTING",
        };
        f.write_str(s)
    }
}

/// Where a driver runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverTarget {
    /// Child process of this broker.
    Local {
        binary: PathBuf,
        args: Vec<String>,
        device_name: Option<String>,
        skeleton: Option<PathBuf>,
        config: Option<PathBuf>,
    },
    /// Device(s) served by another broker.
    Remote {
        device: Option<String>,
        host: String,
        port: u16,
    },
}

/// Everything needed to (re)launch a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSpec {
    name: String,
    target: DriverTarget,
}

impl DriverSpec {
    /// Local driver named after the binary's file name.
    pub fn local(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.display().to_string());
        Self {
            name,
            target: DriverTarget::Local {
                binary,
                args: Vec::new(),
                device_name: None,
                skeleton: None,
                config: None,
            },
        }
    }

    /// Remote proxy, named `device@host:port`.
    pub fn remote(device: Option<&str>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            name: format!("{}@{}:{}", device.unwrap_or(""), host, port),
            target: DriverTarget::Remote {
                device: device.map(str::to_string),
                host,
                port,
            },
        }
    }

    /// Parses a command line driver argument: a binary path or `device@host[:port]`.
    pub fn parse(text: &str) -> Result<Self> {
        if text.contains('@') {
            Self::parse_remote(text)
        } else if text.is_empty() {
            Err(ServerError::config("empty driver name"))
        } else {
            Ok(Self::local(text))
        }
    }

    /// Parses `device@host[:port]`. An empty device proxies every device.
    pub fn parse_remote(text: &str) -> Result<Self> {
        let (device, address) = text
            .rsplit_once('@')
            .ok_or_else(|| ServerError::config(format!("'{text}' is not device@host[:port]")))?;
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ServerError::config(format!("invalid port in '{text}'")))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ServerError::config(format!("missing host in '{text}'")));
        }
        let device = (!device.is_empty()).then_some(device);
        Ok(Self::remote(device, host, port))
    }

    /// Sets `INDIDEV` and renames the driver.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if let DriverTarget::Local { device_name, .. } = &mut self.target {
            *device_name = Some(name.clone());
            self.name = name;
        }
        self
    }

    pub fn with_skeleton(mut self, path: impl Into<PathBuf>) -> Self {
        if let DriverTarget::Local { skeleton, .. } = &mut self.target {
            *skeleton = Some(path.into());
        }
        self
    }

    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        if let DriverTarget::Local { config, .. } = &mut self.target {
            *config = Some(path.into());
        }
        self
    }

    pub fn with_args(mut self, extra: Vec<String>) -> Self {
        if let DriverTarget::Local { args, .. } = &mut self.target {
            *args = extra;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &DriverTarget {
        &self.target
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.target, DriverTarget::Remote { .. })
    }

    /// Device filter applied to a remote proxy.
    pub fn device_filter(&self) -> Option<&str> {
        match &self.target {
            DriverTarget::Remote { device, .. } => device.as_deref(),
            DriverTarget::Local { .. } => None,
        }
    }

    /// True if `target` names this driver by name, binary path, binary file name
    /// or remote address.
    pub fn matches(&self, target: &str) -> bool {
        if self.name == target {
            return true;
        }
        match &self.target {
            DriverTarget::Local { binary, .. } => {
                binary == Path::new(target)
                    || binary.file_name().is_some_and(|n| n == target)
            }
            DriverTarget::Remote { .. } => false,
        }
    }
}

/// Supervision knobs for the driver manager.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_delay: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub limits: QueueLimits,
    pub max_element_bytes: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        crate::config::ServerConfig::default().driver_settings()
    }
}

#[derive(Debug)]
struct DriverRecord {
    spec: DriverSpec,
    state: DriverState,
    generation: u64,
    restarts: RestartWindow,
    peer: Option<QueueId>,
    child: Option<ChildProcess>,
}

impl DriverRecord {
    fn set_state(&mut self, state: DriverState, handle: &BrokerHandle) {
        if self.state == state {
            return;
        }
        info!(driver = %self.spec.name(), from = %self.state, to = %state, "Driver state changed");
        self.state = state;
        handle.publish(AdminEvent::DriverState {
            driver: self.spec.name().to_string(),
            state,
        });
    }

    fn fail(&mut self, reason: String, handle: &BrokerHandle) {
        error!(driver = %self.spec.name(), %reason, "Driver stopped");
        self.set_state(DriverState::Stopped, handle);
        handle.publish(AdminEvent::DriverFailed {
            driver: self.spec.name().to_string(),
            reason,
        });
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                debug!(driver = %self.spec.name(), error = %e, "Kill skipped");
            }
        }
    }
}

/// Owns every driver and its restart bookkeeping.
///
/// Lives inside the broker actor; all methods run on the broker task and
/// take the router explicitly.
pub struct DriverManager {
    drivers: BTreeMap<String, DriverRecord>,
    settings: DriverSettings,
    handle: BrokerHandle,
}

impl DriverManager {
    pub fn new(settings: DriverSettings, handle: BrokerHandle) -> Self {
        Self {
            drivers: BTreeMap::new(),
            settings,
            handle,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Current state of a driver.
    pub fn state(&self, name: &str) -> Option<DriverState> {
        self.drivers.get(name).map(|r| r.state)
    }

    /// Router queue of a connected driver.
    pub fn peer_of(&self, name: &str) -> Option<QueueId> {
        self.drivers.get(name).and_then(|r| r.peer)
    }

    /// Names of all known drivers, stopped ones included.
    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// True if `id` is the queue of one of our drivers.
    pub fn is_driver_peer(&self, id: QueueId) -> bool {
        self.drivers.values().any(|r| r.peer == Some(id))
    }

    /// Starts a driver. Restart history is cleared.
    #[instrument(skip_all, fields(driver = %spec.name()))]
    pub fn start(&mut self, spec: DriverSpec, router: &mut Router) -> Result<Dispatch> {
        let name = spec.name().to_string();
        if self.state(&name).is_some_and(|s| s.is_active()) {
            return Err(ServerError::driver(name, "already running"));
        }

        // Generations keep counting across starts so late events of an
        // earlier incarnation never match.
        let generation = self.drivers.get(&name).map_or(0, |r| r.generation);
        let record = DriverRecord {
            spec,
            state: DriverState::Stopped,
            generation,
            restarts: RestartWindow::new(
                self.settings.max_restarts,
                self.settings.restart_window,
            ),
            peer: None,
            child: None,
        };
        self.drivers.insert(name.clone(), record);
        self.launch(&name, router)
    }

    /// Stops a driver by name, binary or remote target.
    #[instrument(skip(self, router))]
    pub fn stop(&mut self, target: &str, name: Option<&str>, router: &mut Router) -> Result<Dispatch> {
        let found = self
            .drivers
            .iter()
            .find(|(_, r)| {
                r.state.is_active()
                    && name.map_or(true, |n| r.spec.name() == n)
                    && r.spec.matches(target)
            })
            .map(|(key, _)| key.clone());

        match found {
            Some(key) => Ok(self.halt(&key, router)),
            None => Err(ServerError::driver(target, "not running")),
        }
    }

    /// Stops every driver. Used at shutdown.
    pub fn stop_all(&mut self, router: &mut Router) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for key in self.names() {
            dispatch.absorb(self.halt(&key, router));
        }
        dispatch
    }

    fn halt(&mut self, key: &str, router: &mut Router) -> Dispatch {
        let Some(record) = self.drivers.get_mut(key) else {
            return Dispatch::default();
        };
        record.generation += 1;
        record.kill();
        record.child = None;
        record.restarts.reset();
        let dispatch = record
            .peer
            .take()
            .map(|id| router.detach(id))
            .unwrap_or_default();
        record.set_state(DriverState::Stopped, &self.handle);
        dispatch
    }

    fn launch(&mut self, name: &str, router: &mut Router) -> Result<Dispatch> {
        let Some(record) = self.drivers.get_mut(name) else {
            return Ok(Dispatch::default());
        };
        record.generation += 1;
        let generation = record.generation;
        record.set_state(DriverState::Starting, &self.handle);

        match record.spec.target().clone() {
            DriverTarget::Local { .. } => {
                let mut launched = match local::launch(&record.spec) {
                    Ok(launched) => launched,
                    Err(e) => {
                        record.fail(format!("launch failed: {e}"), &self.handle);
                        return Err(e);
                    }
                };
                info!(driver = %name, pid = ?launched.child.pid(), generation, "Driver launched");

                let queue = MsgQueue::new(
                    name,
                    PeerKind::Driver {
                        name: name.to_string(),
                        generation,
                        remote: false,
                    },
                    Requirements::SHARED,
                    self.settings.limits,
                );
                let (id, heartbeat) = router.attach(queue.clone(), None)?;
                record.peer = Some(id);
                peer::spawn(
                    &self.handle,
                    PeerContext {
                        id,
                        heartbeat,
                        queue,
                        device_filter: None,
                        max_element_bytes: self.settings.max_element_bytes,
                    },
                    split_unix(launched.stream),
                );

                if let Some(exit) = launched.child.take_exit() {
                    let handle = self.handle.clone();
                    let name = name.to_string();
                    tokio::spawn(async move {
                        let outcome = exit.await.unwrap_or_default();
                        handle
                            .post(BrokerEvent::DriverExited {
                                name,
                                generation,
                                outcome,
                            })
                            .await;
                    });
                }
                record.child = Some(launched.child);

                let handle = self.handle.clone();
                let timeout = self.settings.handshake_timeout;
                let driver = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    handle
                        .post(BrokerEvent::HandshakeTimeout {
                            name: driver,
                            generation,
                        })
                        .await;
                });

                Ok(router.send_to(id, &Msg::get_properties(None, None)))
            }
            DriverTarget::Remote { host, port, .. } => {
                remote::connect(
                    self.handle.clone(),
                    name.to_string(),
                    generation,
                    host,
                    port,
                    self.settings.connect_timeout,
                );
                Ok(Dispatch::default())
            }
        }
    }

    /// First message from a driver completes its handshake.
    pub fn on_activity(&mut self, from: QueueId) {
        if let Some(record) = self.drivers.values_mut().find(|r| r.peer == Some(from)) {
            if record.state == DriverState::Starting {
                record.set_state(DriverState::Running, &self.handle);
            }
        }
    }

    /// A local driver process ended.
    pub fn on_exit(
        &mut self,
        name: &str,
        generation: u64,
        outcome: ExitOutcome,
        router: &mut Router,
    ) -> Dispatch {
        let Some(record) = self.drivers.get_mut(name) else {
            return Dispatch::default();
        };
        if record.generation != generation {
            debug!(driver = %name, generation, "Ignoring exit of a previous launch");
            return Dispatch::default();
        }

        record.child = None;
        let dispatch = record
            .peer
            .take()
            .map(|id| router.detach(id))
            .unwrap_or_default();
        warn!(driver = %name, %outcome, "Driver exited");
        let state = if outcome.is_clean() {
            DriverState::Exited
        } else {
            DriverState::Crashed
        };
        record.set_state(state, &self.handle);
        self.schedule_restart(name);
        dispatch
    }

    /// A driver's connection closed or overflowed. Returns `None` if `id`
    /// does not belong to a driver.
    pub fn on_peer_closed(&mut self, id: QueueId, router: &mut Router) -> Option<Dispatch> {
        let (name, record) = self.drivers.iter_mut().find(|(_, r)| r.peer == Some(id))?;
        let name = name.clone();
        record.peer = None;
        let dispatch = router.detach(id);

        if record.spec.is_remote() {
            warn!(driver = %name, "Remote connection lost");
            record.generation += 1;
            record.set_state(DriverState::Crashed, &self.handle);
            self.schedule_restart(&name);
        } else {
            // The exit notification drives the restart.
            record.kill();
        }
        Some(dispatch)
    }

    /// No message arrived within the handshake timeout.
    pub fn on_handshake_timeout(&mut self, name: &str, generation: u64) {
        if let Some(record) = self.drivers.get_mut(name) {
            if record.generation == generation && record.state == DriverState::Starting {
                warn!(driver = %name, timeout = ?self.settings.handshake_timeout, "Driver handshake timed out");
                record.kill();
            }
        }
    }

    /// The restart delay elapsed.
    pub fn on_restart_due(&mut self, name: &str, generation: u64, router: &mut Router) -> Result<Dispatch> {
        match self.drivers.get(name) {
            Some(record)
                if record.generation == generation && record.state == DriverState::Restarting =>
            {
                self.launch(name, router)
            }
            _ => Ok(Dispatch::default()),
        }
    }

    /// A remote proxy connected.
    pub fn on_remote_connected(
        &mut self,
        name: &str,
        generation: u64,
        stream: TcpStream,
        router: &mut Router,
    ) -> Result<Dispatch> {
        let Some(record) = self.drivers.get_mut(name) else {
            return Ok(Dispatch::default());
        };
        if record.generation != generation || record.state != DriverState::Starting {
            debug!(driver = %name, generation, "Dropping stale remote connection");
            return Ok(Dispatch::default());
        }

        let device = record.spec.device_filter().map(str::to_string);
        let queue = MsgQueue::new(
            name,
            PeerKind::Driver {
                name: name.to_string(),
                generation,
                remote: true,
            },
            Requirements::INLINE,
            self.settings.limits,
        );
        let (id, heartbeat) = router.attach(queue.clone(), device.clone())?;
        record.peer = Some(id);
        record.set_state(DriverState::Running, &self.handle);
        info!(driver = %name, device = ?device, "Remote proxy connected");

        peer::spawn(
            &self.handle,
            PeerContext {
                id,
                heartbeat,
                queue,
                device_filter: device.clone(),
                max_element_bytes: self.settings.max_element_bytes,
            },
            split_tcp(stream),
        );

        let mut dispatch = Dispatch::default();
        for msg in remote::greeting(device.as_deref()) {
            dispatch.absorb(router.send_to(id, &msg));
        }
        Ok(dispatch)
    }

    /// A remote proxy could not connect. Counts as a crash.
    pub fn on_remote_failed(&mut self, name: &str, generation: u64, reason: &str) {
        let Some(record) = self.drivers.get_mut(name) else {
            return;
        };
        if record.generation != generation || record.state != DriverState::Starting {
            return;
        }
        warn!(driver = %name, %reason, "Remote connect failed");
        record.set_state(DriverState::Crashed, &self.handle);
        self.schedule_restart(name);
    }

    fn schedule_restart(&mut self, name: &str) {
        let Some(record) = self.drivers.get_mut(name) else {
            return;
        };
        match record.restarts.record_exit() {
            RestartDecision::Restart { attempt } => {
                info!(driver = %name, attempt, delay = ?self.settings.restart_delay, "Scheduling driver restart");
                record.set_state(DriverState::Restarting, &self.handle);
                let handle = self.handle.clone();
                let delay = self.settings.restart_delay;
                let generation = record.generation;
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle
                        .post(BrokerEvent::RestartDue { name, generation })
                        .await;
                });
            }
            RestartDecision::GiveUp { exits } => {
                let reason = format!(
                    "{} unexpected exits within {:?}",
                    exits,
                    record.restarts.window()
                );
                record.fail(reason, &self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_display() {
        assert_eq!(DriverState::Restarting.to_string(), "RESTARTING");
        assert!(!DriverState::Stopped.is_active());
        assert!(DriverState::Crashed.is_active());
    }

    #[test]
    fn test_parse_local() {
        let spec = DriverSpec::parse("/usr/bin/indi_simulator_ccd").unwrap();
        assert_eq!(spec.name(), "indi_simulator_ccd");
        assert!(!spec.is_remote());
        assert!(spec.matches("indi_simulator_ccd"));
        assert!(spec.matches("/usr/bin/indi_simulator_ccd"));
        assert!(!spec.matches("indi_lx200"));
        assert!(DriverSpec::parse("").is_err());
    }

    #[test]
    fn test_device_name_renames() {
        let spec = DriverSpec::local("/usr/bin/indi_simulator_ccd").with_device_name("CCD Simulator");
        assert_eq!(spec.name(), "CCD Simulator");
        assert!(spec.matches("indi_simulator_ccd"));
        assert!(spec.matches("CCD Simulator"));
    }

    #[test]
    fn test_parse_remote() {
        let spec = DriverSpec::parse("Telescope@mount.local:7625").unwrap();
        assert_eq!(
            spec.target(),
            &DriverTarget::Remote {
                device: Some("Telescope".into()),
                host: "mount.local".into(),
                port: 7625,
            }
        );
        assert_eq!(spec.device_filter(), Some("Telescope"));
        assert_eq!(spec.name(), "Telescope@mount.local:7625");
        assert!(spec.matches("Telescope@mount.local:7625"));

        let spec = DriverSpec::parse("@mount.local").unwrap();
        assert_eq!(spec.device_filter(), None);
        assert_eq!(spec.name(), "@mount.local:7624");

        assert!(DriverSpec::parse("Telescope@").is_err());
        assert!(DriverSpec::parse("Telescope@host:notaport").is_err());
    }

    #[test]
    fn test_remote_ignores_local_options() {
        let spec = DriverSpec::remote(Some("Cam"), "host", 7624).with_device_name("Other");
        assert_eq!(spec.name(), "Cam@host:7624");
    }

    fn manager(settings: DriverSettings) -> (DriverManager, Router, mpsc::Receiver<BrokerEvent>) {
        let (handle, events) = BrokerHandle::channel();
        (DriverManager::new(settings, handle), Router::new(16), events)
    }

    #[tokio::test]
    async fn test_start_missing_binary_stops() {
        let (mut drivers, mut router, _events) = manager(DriverSettings::default());
        let mut admin = drivers.handle.subscribe();

        let spec = DriverSpec::local("/nonexistent/indi_missing");
        assert!(drivers.start(spec, &mut router).is_err());
        assert_eq!(drivers.state("indi_missing"), Some(DriverState::Stopped));
        assert_eq!(router.peer_count(), 0);

        assert_eq!(
            admin.recv().await.unwrap(),
            AdminEvent::DriverState {
                driver: "indi_missing".into(),
                state: DriverState::Starting,
            }
        );
        assert_eq!(
            admin.recv().await.unwrap(),
            AdminEvent::DriverState {
                driver: "indi_missing".into(),
                state: DriverState::Stopped,
            }
        );
        assert!(matches!(
            admin.recv().await.unwrap(),
            AdminEvent::DriverFailed { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_restart_then_give_up() {
        let settings = DriverSettings {
            max_restarts: 1,
            restart_delay: Duration::from_millis(1),
            ..DriverSettings::default()
        };
        let (mut drivers, mut router, _events) = manager(settings);

        drivers
            .start(DriverSpec::local("/bin/cat"), &mut router)
            .unwrap();
        assert_eq!(drivers.state("cat"), Some(DriverState::Starting));
        assert_eq!(router.peer_count(), 1);
        let peer = drivers.peer_of("cat").unwrap();
        assert!(drivers.is_driver_peer(peer));

        drivers.on_activity(peer);
        assert_eq!(drivers.state("cat"), Some(DriverState::Running));

        // Stale generation is ignored.
        drivers.on_exit("cat", 0, ExitOutcome::default(), &mut router);
        assert_eq!(drivers.state("cat"), Some(DriverState::Running));

        drivers.on_exit("cat", 1, ExitOutcome::default(), &mut router);
        assert_eq!(drivers.state("cat"), Some(DriverState::Restarting));
        assert_eq!(router.peer_count(), 0);

        drivers.on_restart_due("cat", 1, &mut router).unwrap();
        assert_eq!(drivers.state("cat"), Some(DriverState::Starting));

        drivers.on_exit("cat", 2, ExitOutcome::default(), &mut router);
        assert_eq!(drivers.state("cat"), Some(DriverState::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_clears_and_invalidates() {
        let (mut drivers, mut router, _events) = manager(DriverSettings::default());
        drivers
            .start(DriverSpec::local("/bin/cat").with_device_name("Cat"), &mut router)
            .unwrap();

        assert!(drivers.stop("indi_other", None, &mut router).is_err());
        drivers.stop("cat", Some("Cat"), &mut router).unwrap();
        assert_eq!(drivers.state("Cat"), Some(DriverState::Stopped));
        assert_eq!(router.peer_count(), 0);

        // The exit of the stopped launch no longer matters.
        drivers.on_exit("Cat", 1, ExitOutcome::default(), &mut router);
        assert_eq!(drivers.state("Cat"), Some(DriverState::Stopped));

        // Stopped drivers can be started again under the same name.
        drivers
            .start(DriverSpec::local("/bin/cat").with_device_name("Cat"), &mut router)
            .unwrap();
        assert_eq!(drivers.state("Cat"), Some(DriverState::Starting));
        assert!(drivers
            .start(DriverSpec::local("/bin/cat").with_device_name("Cat"), &mut router)
            .is_err());
        drivers.stop_all(&mut router);
    }

    #[tokio::test]
    async fn test_remote_failure_counts_as_crash() {
        let settings = DriverSettings {
            max_restarts: 0,
            ..DriverSettings::default()
        };
        let (mut drivers, mut router, _events) = manager(settings);
        drivers
            .start(DriverSpec::remote(Some("Cam"), "127.0.0.1", 1), &mut router)
            .unwrap();
        let name = "Cam@127.0.0.1:1";
        assert_eq!(drivers.state(name), Some(DriverState::Starting));

        drivers.on_remote_failed(name, 1, "connection refused");
        assert_eq!(drivers.state(name), Some(DriverState::Stopped));
    }
}
