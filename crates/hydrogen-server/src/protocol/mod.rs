//! Property protocol: XML framing, messages, blobs and serialization.
//!
//! Only what routing needs is interpreted. Element values travel through
//! the broker untouched.

pub mod blob;
pub mod msg;
pub mod serialized;
pub mod xml;

pub use blob::{BlobAttachment, SharedBuffer};
pub use msg::{BlobMode, Msg, MsgKind, PropertyType};
pub use serialized::{
    AwaiterId, Chunk, ContentState, Cursor, Requirements, SerializationStatus, SerializedMsg,
};
pub use xml::{XmlElement, XmlParser};

/// Protocol version announced in `getProperties`.
pub const PROTOCOL_VERSION: &str = "1.7";
