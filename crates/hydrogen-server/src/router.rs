//! Routing table and fan-out.
//!
//! The router owns every connected peer (clients and drivers alike, each
//! represented by its [`MsgQueue`]) in a [`SafeRegistry`], the table
//! `device -> { owner, watchers }`, and the definition cache used to replay
//! state to late subscribers. It is mutated only from the broker task.
//!
//! Per destination, messages are offered in routing order, so a value
//! update is never delivered ahead of the definition it refers to.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use hydrogen_common::{EntryId, Heartbeat, SafeRegistry};
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::protocol::{BlobMode, Msg, MsgKind, SerializedMsg};
use crate::queue::{MsgQueue, Offer, PeerKind};

/// Handle of a peer registered with the router.
pub type QueueId = EntryId;

/// What a device watcher is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Watch {
    all: bool,
    properties: BTreeSet<String>,
}

impl Watch {
    fn matches(&self, property: Option<&str>) -> bool {
        match property {
            _ if self.all => true,
            Some(p) => self.properties.contains(p),
            None => !self.properties.is_empty(),
        }
    }

    fn add(&mut self, property: Option<&str>) {
        match property {
            Some(p) => {
                self.properties.insert(p.to_owned());
            }
            None => self.all = true,
        }
    }

    /// Returns true if nothing is left.
    fn remove(&mut self, property: Option<&str>) -> bool {
        match property {
            Some(p) => {
                self.properties.remove(p);
            }
            None => {
                self.all = false;
                self.properties.clear();
            }
        }
        !self.all && self.properties.is_empty()
    }
}

#[derive(Debug, Default)]
struct DeviceRoute {
    owner: Option<QueueId>,
    watchers: BTreeMap<QueueId, Watch>,
}

impl DeviceRoute {
    fn is_unused(&self) -> bool {
        self.owner.is_none() && self.watchers.is_empty()
    }
}

/// Per-destination `enableBLOB` state.
#[derive(Debug, Default)]
struct BlobModes {
    default: BlobMode,
    devices: HashMap<String, BlobMode>,
    properties: HashMap<(String, String), BlobMode>,
}

impl BlobModes {
    fn set(&mut self, device: Option<&str>, property: Option<&str>, mode: BlobMode) {
        match (device, property) {
            (None, _) => {
                self.default = mode;
                self.devices.clear();
                self.properties.clear();
            }
            (Some(d), None) => {
                self.devices.insert(d.to_owned(), mode);
                self.properties.retain(|(dev, _), _| dev != d);
            }
            (Some(d), Some(p)) => {
                self.properties.insert((d.to_owned(), p.to_owned()), mode);
            }
        }
    }

    fn mode_for(&self, device: Option<&str>, property: Option<&str>) -> BlobMode {
        if let (Some(d), Some(p)) = (device, property) {
            if let Some(mode) = self.properties.get(&(d.to_owned(), p.to_owned())) {
                return *mode;
            }
        }
        device
            .and_then(|d| self.devices.get(d))
            .copied()
            .unwrap_or(self.default)
    }

    fn admits(&self, msg: &Msg) -> bool {
        let carries_blob = msg.is_blob_vector() && !matches!(msg.kind(), MsgKind::Define(_));
        self.mode_for(msg.device(), msg.name()).admits(carries_blob)
    }
}

struct Peer {
    queue: Arc<MsgQueue>,
    blob_modes: BlobModes,
    device_filter: Option<String>,
}

impl Peer {
    fn accepts_device(&self, device: Option<&str>) -> bool {
        match (&self.device_filter, device) {
            (Some(filter), Some(device)) => filter == device,
            _ => true,
        }
    }
}

/// Definitions in first-definition order.
#[derive(Debug, Default)]
struct DefinitionCache {
    seq: u64,
    index: HashMap<(String, String), u64>,
    ordered: BTreeMap<u64, Arc<Msg>>,
}

impl DefinitionCache {
    fn insert(&mut self, msg: &Arc<Msg>) {
        let (Some(device), Some(name)) = (msg.device(), msg.name()) else {
            return;
        };
        let key = (device.to_owned(), name.to_owned());
        match self.index.get(&key) {
            Some(seq) => {
                self.ordered.insert(*seq, Arc::clone(msg));
            }
            None => {
                self.seq += 1;
                self.index.insert(key, self.seq);
                self.ordered.insert(self.seq, Arc::clone(msg));
            }
        }
    }

    fn remove(&mut self, device: &str, name: Option<&str>) {
        let ordered = &mut self.ordered;
        self.index.retain(|(d, n), seq| {
            let hit = d == device && name.map_or(true, |name| n.as_str() == name);
            if hit {
                ordered.remove(&*seq);
            }
            !hit
        });
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<Msg>> {
        self.ordered.values()
    }
}

/// Outcome of routing one message.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Destinations the message was queued for.
    pub delivered: usize,
    /// Destinations whose blob was dropped by the stream limit.
    pub dropped_blobs: usize,
    /// Destinations skipped by their `enableBLOB` policy.
    pub withheld: usize,
    /// Queues that overflowed and must be torn down.
    pub overflowed: Vec<QueueId>,
    productions: Vec<Arc<SerializedMsg>>,
}

impl Dispatch {
    /// Combines the outcome of several routing steps.
    pub fn absorb(&mut self, other: Dispatch) {
        self.delivered += other.delivered;
        self.dropped_blobs += other.dropped_blobs;
        self.withheld += other.withheld;
        self.overflowed.extend(other.overflowed);
        self.productions.extend(other.productions);
    }
}

/// Device routing table plus the registry of connected peers.
pub struct Router {
    peers: SafeRegistry<Peer>,
    devices: HashMap<String, DeviceRoute>,
    wildcard: BTreeSet<QueueId>,
    definitions: DefinitionCache,
    max_clients: usize,
}

impl Router {
    pub fn new(max_clients: usize) -> Self {
        Self {
            peers: SafeRegistry::new(),
            devices: HashMap::new(),
            wildcard: BTreeSet::new(),
            definitions: DefinitionCache::default(),
            max_clients,
        }
    }

    /// Registers a peer. Owns nothing and watches nothing until it asks.
    ///
    /// Clients beyond the connection limit are refused.
    pub fn attach(
        &mut self,
        queue: Arc<MsgQueue>,
        device_filter: Option<String>,
    ) -> Result<(QueueId, Heartbeat)> {
        if *queue.kind() == PeerKind::Client && self.client_count() >= self.max_clients {
            return Err(ServerError::ConnectionLimit(self.max_clients));
        }

        let label = queue.label().to_owned();
        let id = self.peers.insert(Peer {
            queue,
            blob_modes: BlobModes::default(),
            device_filter,
        });
        let heartbeat = self
            .peers
            .heartbeat(id)
            .ok_or_else(|| ServerError::driver(&label, "peer vanished during attach"))?;
        debug!(peer = %label, id = %id, "Peer attached");
        Ok((id, heartbeat))
    }

    /// Unregisters a peer: closes its queue, drops its watches, and
    /// withdraws every device it owned from the remaining subscribers.
    ///
    /// Unknown ids are a no-op.
    pub fn detach(&mut self, id: QueueId) -> Dispatch {
        let mut out = Dispatch::default();
        let Some(peer) = self.peers.erase(id) else {
            return out;
        };
        peer.queue.close();

        self.wildcard.remove(&id);
        let mut owned = Vec::new();
        for (device, route) in self.devices.iter_mut() {
            route.watchers.remove(&id);
            if route.owner == Some(id) {
                route.owner = None;
                owned.push(device.clone());
            }
        }

        for device in &owned {
            info!(peer = %peer.queue.label(), device = %device, "Device withdrawn");
            self.definitions.remove(device, None);
            let del = Msg::del_property(device);
            self.fan_out(id, &del, &mut out);
        }
        self.devices.retain(|_, route| !route.is_unused());

        debug!(peer = %peer.queue.label(), id = %id, "Peer detached");
        self.finish(out)
    }

    /// Routes one inbound message from `from`.
    pub fn dispatch(&mut self, from: QueueId, msg: &Arc<Msg>) -> Result<Dispatch> {
        let Some(peer) = self.peers.lookup(from) else {
            return Ok(Dispatch::default());
        };
        let from_driver = peer.queue.kind().is_driver();
        let mut out = Dispatch::default();

        match msg.kind() {
            MsgKind::GetProperties => {
                self.add_watch(from, msg.device(), msg.name(), &mut out);
            }
            MsgKind::EnableBlob => {
                let mode = msg.blob_mode().unwrap_or_default();
                if let Some(peer) = self.peers.lookup_mut(from) {
                    peer.blob_modes.set(msg.device(), msg.name(), mode);
                }
            }
            MsgKind::New(_) => {
                let device = msg.device().unwrap_or_default();
                let owner = self
                    .devices
                    .get(device)
                    .and_then(|route| route.owner)
                    .ok_or_else(|| ServerError::UnknownDevice(device.to_owned()))?;
                if owner != from {
                    self.deliver(owner, msg, false, &mut out);
                }
            }
            MsgKind::Define(_) | MsgKind::Set(_) | MsgKind::DelProperty => {
                if !from_driver {
                    return Err(ServerError::malformed(format!(
                        "<{}> is only accepted from drivers",
                        msg.root().tag
                    )));
                }
                let device = msg.device().unwrap_or_default();
                self.claim(from, device)?;
                match msg.kind() {
                    MsgKind::Define(_) => self.definitions.insert(msg),
                    MsgKind::DelProperty => self.definitions.remove(device, msg.name()),
                    _ => {}
                }
                self.fan_out(from, msg, &mut out);
            }
            MsgKind::Message => {
                if !from_driver {
                    return Err(ServerError::malformed("<message> is only accepted from drivers"));
                }
                match msg.device() {
                    Some(_) => self.fan_out(from, msg, &mut out),
                    None => {
                        let clients: Vec<QueueId> = self
                            .peers
                            .iter()
                            .filter(|(_, p)| *p.queue.kind() == PeerKind::Client)
                            .map(|(id, _)| id)
                            .collect();
                        for id in clients {
                            self.deliver(id, msg, true, &mut out);
                        }
                    }
                }
            }
        }

        Ok(self.finish(out))
    }

    /// Queues a message for exactly one peer, bypassing the table.
    pub fn send_to(&mut self, id: QueueId, msg: &Arc<Msg>) -> Dispatch {
        let mut out = Dispatch::default();
        self.deliver(id, msg, false, &mut out);
        self.finish(out)
    }

    /// Adds a snoop on behalf of `id` and replays matching definitions.
    pub fn add_snoop(&mut self, id: QueueId, device: &str, property: Option<&str>) -> Dispatch {
        let mut out = Dispatch::default();
        if self.peers.contains(id) {
            self.add_watch(id, Some(device), property, &mut out);
        }
        self.finish(out)
    }

    /// Removes a snoop; other watches of `id` are unaffected.
    pub fn remove_snoop(&mut self, id: QueueId, device: &str, property: Option<&str>) {
        if let Some(route) = self.devices.get_mut(device) {
            if let Some(watch) = route.watchers.get_mut(&id) {
                if watch.remove(property) {
                    route.watchers.remove(&id);
                }
            }
            if route.is_unused() {
                self.devices.remove(device);
            }
        }
    }

    pub fn queue(&self, id: QueueId) -> Option<&Arc<MsgQueue>> {
        self.peers.lookup(id).map(|p| &p.queue)
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.peers.contains(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn client_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|(_, p)| *p.queue.kind() == PeerKind::Client)
            .count()
    }

    pub fn peer_ids(&self) -> Vec<QueueId> {
        self.peers.ids()
    }

    /// Returns the current owner of a device.
    pub fn owner(&self, device: &str) -> Option<QueueId> {
        self.devices.get(device).and_then(|r| r.owner)
    }

    /// Number of cached definitions.
    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    fn claim(&mut self, from: QueueId, device: &str) -> Result<()> {
        let route = self.devices.entry(device.to_owned()).or_default();
        match route.owner {
            Some(owner) if owner != from => Err(ServerError::malformed(format!(
                "device {} is owned by another driver",
                device
            ))),
            Some(_) => Ok(()),
            None => {
                route.owner = Some(from);
                Ok(())
            }
        }
    }

    fn add_watch(
        &mut self,
        id: QueueId,
        device: Option<&str>,
        property: Option<&str>,
        out: &mut Dispatch,
    ) {
        match device {
            None => {
                self.wildcard.insert(id);
            }
            Some(d) => {
                self.devices
                    .entry(d.to_owned())
                    .or_default()
                    .watchers
                    .entry(id)
                    .or_default()
                    .add(property);
            }
        }

        let replay: Vec<Arc<Msg>> = self
            .definitions
            .iter()
            .filter(|def| {
                let def_device = def.device().unwrap_or_default();
                device.map_or(true, |d| d == def_device)
                    && property.map_or(true, |p| def.name() == Some(p))
                    && self.owner(def_device) != Some(id)
            })
            .cloned()
            .collect();
        for def in &replay {
            self.deliver(id, def, true, out);
        }
    }

    /// Every watcher of the message's device and property, minus `from`.
    fn fan_out(&mut self, from: QueueId, msg: &Arc<Msg>, out: &mut Dispatch) {
        let mut targets: BTreeSet<QueueId> = self.wildcard.clone();
        if let Some(route) = msg.device().and_then(|d| self.devices.get(d)) {
            let property = match msg.kind() {
                MsgKind::Message => None,
                _ => msg.name(),
            };
            targets.extend(
                route
                    .watchers
                    .iter()
                    .filter(|(_, w)| match property {
                        Some(_) => w.matches(property),
                        None => true,
                    })
                    .map(|(id, _)| *id),
            );
        }
        targets.remove(&from);

        for id in targets {
            self.deliver(id, msg, true, out);
        }
    }

    fn deliver(&mut self, id: QueueId, msg: &Arc<Msg>, apply_blob_mode: bool, out: &mut Dispatch) {
        let Some(peer) = self.peers.lookup(id) else {
            return;
        };
        if !peer.accepts_device(msg.device()) {
            return;
        }
        if apply_blob_mode && !peer.blob_modes.admits(msg) {
            out.withheld += 1;
            return;
        }
        match peer.queue.offer(msg) {
            Offer::Queued(serialized) => {
                out.delivered += 1;
                out.productions.push(serialized);
            }
            Offer::BlobDropped => {
                debug!(peer = %peer.queue.label(), msg = ?msg, "Blob dropped by stream limit");
                out.dropped_blobs += 1;
            }
            Offer::Overflow => {
                warn!(
                    peer = %peer.queue.label(),
                    queued = peer.queue.queued_bytes(),
                    "Queue limit exceeded, tearing down"
                );
                out.overflowed.push(id);
            }
            Offer::Closed => {}
        }
    }

    /// Starts productions only after every destination has enqueued, so
    /// awaiters are complete before the first byte is produced.
    fn finish(&mut self, mut out: Dispatch) -> Dispatch {
        for serialized in out.productions.drain(..) {
            serialized.start();
        }
        out
    }
}
