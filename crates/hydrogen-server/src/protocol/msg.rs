//! Parsed protocol messages.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::blob::{BlobAttachment, SharedBuffer};
use super::serialized::{Requirements, SerializedMsg};
use super::xml::XmlElement;
use super::PROTOCOL_VERSION;
use crate::error::{Result, ServerError};

/// Rough per-blob overhead of the `enclen`/`attached` attributes.
const BLOB_ATTR_OVERHEAD: usize = 32;

/// Element type of a property vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl PropertyType {
    fn from_vector_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "TextVector" => Some(Self::Text),
            "NumberVector" => Some(Self::Number),
            "SwitchVector" => Some(Self::Switch),
            "LightVector" => Some(Self::Light),
            "BLOBVector" => Some(Self::Blob),
            _ => None,
        }
    }
}

/// What a message asks the broker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// `def*Vector`: a driver announces a property.
    Define(PropertyType),
    /// `set*Vector`: a driver reports new values.
    Set(PropertyType),
    /// `new*Vector`: a client asks the owning driver for new values.
    New(PropertyType),
    /// `getProperties`: subscription (from clients) or snoop (from drivers).
    GetProperties,
    /// `enableBLOB`: per-destination blob policy.
    EnableBlob,
    /// `message`: free-form text, optionally tied to a device.
    Message,
    /// `delProperty`: a driver withdraws one or all properties.
    DelProperty,
}

impl MsgKind {
    /// Maps a top-level tag to a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "getProperties" => return Some(Self::GetProperties),
            "enableBLOB" => return Some(Self::EnableBlob),
            "message" => return Some(Self::Message),
            "delProperty" => return Some(Self::DelProperty),
            _ => {}
        }
        if let Some(rest) = tag.strip_prefix("def") {
            return PropertyType::from_vector_suffix(rest).map(Self::Define);
        }
        if let Some(rest) = tag.strip_prefix("set") {
            return PropertyType::from_vector_suffix(rest).map(Self::Set);
        }
        if let Some(rest) = tag.strip_prefix("new") {
            return PropertyType::from_vector_suffix(rest).map(Self::New);
        }
        None
    }

    /// Returns the property type for vector messages.
    pub fn property_type(&self) -> Option<PropertyType> {
        match self {
            MsgKind::Define(t) | MsgKind::Set(t) | MsgKind::New(t) => Some(*t),
            _ => None,
        }
    }

    /// Returns true for `def`, `set` and `new` vectors.
    pub fn is_vector(&self) -> bool {
        self.property_type().is_some()
    }
}

/// Blob delivery policy requested with `enableBLOB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobMode {
    /// No blob vectors (default).
    #[default]
    Never,
    /// Blob vectors in addition to everything else.
    Also,
    /// Only blob vectors.
    Only,
}

impl BlobMode {
    /// Parses the text content of `enableBLOB`.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "Never" => Some(Self::Never),
            "Also" => Some(Self::Also),
            "Only" => Some(Self::Only),
            _ => None,
        }
    }

    /// Returns true if a message with the given blob-ness may be delivered.
    pub fn admits(&self, is_blob: bool) -> bool {
        match self {
            BlobMode::Never => !is_blob,
            BlobMode::Also => true,
            BlobMode::Only => is_blob,
        }
    }
}

impl fmt::Display for BlobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        };
        f.write_str(s)
    }
}

/// Immutable parsed message.
///
/// Shared by the router, the definition cache and every [`SerializedMsg`]
/// derived from it. Blob payloads are kept out of [`Msg::root`] and held in
/// [`Msg::blobs`], in the order of the `oneBLOB` children.
pub struct Msg {
    kind: MsgKind,
    device: Option<String>,
    name: Option<String>,
    root: XmlElement,
    blobs: Vec<BlobAttachment>,
    xml_len: usize,
    productions: AtomicUsize,
    serializations: Mutex<HashMap<Requirements, Weak<SerializedMsg>>>,
}

impl Msg {
    /// Builds a message from a parsed element.
    ///
    /// `fds` holds descriptors received with the element's bytes; one is
    /// consumed per `oneBLOB` marked `attached="true"`.
    pub fn from_element(mut root: XmlElement, fds: &mut VecDeque<OwnedFd>) -> Result<Arc<Self>> {
        let kind = MsgKind::from_tag(&root.tag)
            .ok_or_else(|| ServerError::malformed(format!("unknown element <{}>", root.tag)))?;
        let device = root.attr("device").map(str::to_owned);
        let name = root.attr("name").map(str::to_owned);

        if kind.is_vector() && (device.is_none() || name.is_none()) {
            return Err(ServerError::malformed(format!(
                "<{}> requires device and name",
                root.tag
            )));
        }
        if kind == MsgKind::DelProperty && device.is_none() {
            return Err(ServerError::malformed("<delProperty> requires device"));
        }
        if kind == MsgKind::EnableBlob && BlobMode::parse(&root.text).is_none() {
            return Err(ServerError::malformed(format!(
                "<enableBLOB> has invalid mode {:?}",
                root.text.trim()
            )));
        }

        let mut blobs = Vec::new();
        for child in root.children.iter_mut().filter(|c| c.tag == "oneBLOB") {
            let blob_name = child.attr("name").unwrap_or_default().to_owned();
            let format = child.attr("format").unwrap_or_default().to_owned();
            let attached = child.remove_attr("attached").is_some_and(|v| v == "true");
            child.remove_attr("enclen");
            let text = std::mem::take(&mut child.text);

            let blob = if attached {
                let fd = fds.pop_front().ok_or_else(|| {
                    ServerError::malformed(format!("attached blob {} without descriptor", blob_name))
                })?;
                BlobAttachment::from_shared(blob_name, format, SharedBuffer::from_fd(fd)?)
            } else {
                let encoded_len = text.bytes().filter(|b| !b.is_ascii_whitespace()).count();
                BlobAttachment::from_base64(blob_name, format, encoded_len / 4 * 3, text.as_bytes())
            };
            if child.attr("size").is_none() {
                child.set_attr("size", blob.size.to_string());
            }
            blobs.push(blob);
        }

        Ok(Arc::new(Self::assemble(kind, device, name, root, blobs)))
    }

    /// Builds a message from an element carrying no attached descriptors.
    pub fn from_xml(root: XmlElement) -> Result<Arc<Self>> {
        Self::from_element(root, &mut VecDeque::new())
    }

    /// Builds a `getProperties` request.
    pub fn get_properties(device: Option<&str>, name: Option<&str>) -> Arc<Self> {
        let mut root = XmlElement::new("getProperties").with_attr("version", PROTOCOL_VERSION);
        if let Some(device) = device {
            root.set_attr("device", device);
        }
        if let Some(name) = name {
            root.set_attr("name", name);
        }
        Arc::new(Self::assemble(
            MsgKind::GetProperties,
            device.map(str::to_owned),
            name.map(str::to_owned),
            root,
            Vec::new(),
        ))
    }

    /// Builds a `delProperty` for a whole device.
    pub fn del_property(device: &str) -> Arc<Self> {
        let root = XmlElement::new("delProperty").with_attr("device", device);
        Arc::new(Self::assemble(
            MsgKind::DelProperty,
            Some(device.to_owned()),
            None,
            root,
            Vec::new(),
        ))
    }

    /// Builds an `enableBLOB` request.
    pub fn enable_blob(device: Option<&str>, mode: BlobMode) -> Arc<Self> {
        let mut root = XmlElement::new("enableBLOB").with_text(mode.to_string());
        if let Some(device) = device {
            root.set_attr("device", device);
        }
        Arc::new(Self::assemble(
            MsgKind::EnableBlob,
            device.map(str::to_owned),
            None,
            root,
            Vec::new(),
        ))
    }

    fn assemble(
        kind: MsgKind,
        device: Option<String>,
        name: Option<String>,
        root: XmlElement,
        blobs: Vec<BlobAttachment>,
    ) -> Self {
        let xml_len = root.to_bytes().len();
        Self {
            kind,
            device,
            name,
            root,
            blobs,
            xml_len,
            productions: AtomicUsize::new(0),
            serializations: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> MsgKind {
        self.kind
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Element tree with blob text removed.
    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn blobs(&self) -> &[BlobAttachment] {
        &self.blobs
    }

    pub fn has_blobs(&self) -> bool {
        !self.blobs.is_empty()
    }

    /// Returns true for BLOB vectors, which are subject to `enableBLOB`.
    pub fn is_blob_vector(&self) -> bool {
        self.kind.property_type() == Some(PropertyType::Blob)
    }

    /// Returns the requested mode of an `enableBLOB` message.
    pub fn blob_mode(&self) -> Option<BlobMode> {
        match self.kind {
            MsgKind::EnableBlob => BlobMode::parse(&self.root.text),
            _ => None,
        }
    }

    /// Estimates the bytes a destination with `req` will receive.
    pub fn estimated_size(&self, req: Requirements) -> usize {
        let blob_bytes: usize = if req.shared_buffers {
            self.blobs.len() * BLOB_ATTR_OVERHEAD
        } else {
            self.blobs
                .iter()
                .map(|b| b.encoded_len() + BLOB_ATTR_OVERHEAD)
                .sum()
        };
        self.xml_len + blob_bytes
    }

    /// Returns the production for `req`, reusing a live one if possible.
    ///
    /// Requirements are normalized first: a message without blobs renders
    /// identically for every destination, so all of them share one
    /// production.
    pub fn serialize(self: &Arc<Self>, req: Requirements) -> Arc<SerializedMsg> {
        let req = if self.has_blobs() {
            req
        } else {
            Requirements::INLINE
        };

        let mut serializations = self.serializations.lock();
        if let Some(existing) = serializations.get(&req).and_then(Weak::upgrade) {
            if !existing.is_canceled() {
                return existing;
            }
        }
        serializations.retain(|_, w| w.strong_count() > 0);

        let serialized = Arc::new(SerializedMsg::new(Arc::clone(self), req));
        serializations.insert(req, Arc::downgrade(&serialized));
        serialized
    }

    /// Number of productions actually run for this message.
    pub fn production_count(&self) -> usize {
        self.productions.load(Ordering::Relaxed)
    }

    pub(crate) fn note_production(&self) {
        self.productions.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("tag", &self.root.tag)
            .field("device", &self.device)
            .field("name", &self.name)
            .field("blobs", &self.blobs.len())
            .finish()
    }
}
