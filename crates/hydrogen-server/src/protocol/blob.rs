//! Blob payloads and their two wire representations.
//!
//! A blob arrives either base64-encoded inside the XML text or as a
//! shared-memory file descriptor passed next to the XML (co-located peers
//! only). Each representation is derived lazily from the other the first
//! time a destination needs it, and cached for every later destination.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, OnceLock};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use crate::error::{Result, ServerError};

/// Anonymous memory-backed file holding one blob.
#[derive(Debug)]
pub struct SharedBuffer {
    file: File,
    len: usize,
}

impl SharedBuffer {
    /// Creates a new buffer holding a copy of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let file = anonymous_file().map_err(shared_err)?;
        file.write_all_at(data, 0).map_err(shared_err)?;
        Ok(Self {
            file,
            len: data.len(),
        })
    }

    /// Adopts a descriptor received from a peer.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let file = File::from(fd);
        let len = file.metadata().map_err(shared_err)?.len();
        let len = usize::try_from(len)
            .map_err(|_| shared_err(io::Error::from(io::ErrorKind::InvalidData)))?;
        Ok(Self { file, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the whole buffer.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.len];
        self.file.read_exact_at(&mut data, 0).map_err(shared_err)?;
        Ok(data)
    }
}

impl AsFd for SharedBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for SharedBuffer {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn shared_err(source: io::Error) -> ServerError {
    ServerError::SharedBuffer { path: None, source }
}

#[cfg(target_os = "linux")]
fn anonymous_file() -> io::Result<File> {
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

    let fd = memfd_create(c"hydrogen-blob", MemFdCreateFlag::MFD_CLOEXEC)?;
    Ok(File::from(fd))
}

#[cfg(not(target_os = "linux"))]
fn anonymous_file() -> io::Result<File> {
    tempfile::tempfile()
}

/// One `oneBLOB` payload.
#[derive(Debug)]
pub struct BlobAttachment {
    /// Element name inside the vector.
    pub name: String,
    /// Format tag, e.g. `.fits`.
    pub format: String,
    /// Decoded size in bytes.
    pub size: usize,
    shared_origin: bool,
    encoded: OnceLock<Bytes>,
    shared: OnceLock<Arc<SharedBuffer>>,
}

impl BlobAttachment {
    /// Creates an attachment from base64 text. Whitespace is stripped.
    pub fn from_base64(
        name: impl Into<String>,
        format: impl Into<String>,
        size: usize,
        text: &[u8],
    ) -> Self {
        let encoded: Vec<u8> = text
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let attachment = Self::empty(name, format, size);
        let _ = attachment.encoded.set(Bytes::from(encoded));
        attachment
    }

    /// Creates an attachment from raw bytes.
    pub fn from_raw(name: impl Into<String>, format: impl Into<String>, data: &[u8]) -> Self {
        let attachment = Self::empty(name, format, data.len());
        let _ = attachment
            .encoded
            .set(Bytes::from(BASE64_STANDARD.encode(data)));
        attachment
    }

    /// Creates an attachment backed by a shared buffer.
    pub fn from_shared(
        name: impl Into<String>,
        format: impl Into<String>,
        buffer: SharedBuffer,
    ) -> Self {
        let mut attachment = Self::empty(name, format, buffer.len());
        attachment.shared_origin = true;
        let _ = attachment.shared.set(Arc::new(buffer));
        attachment
    }

    fn empty(name: impl Into<String>, format: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            size,
            shared_origin: false,
            encoded: OnceLock::new(),
            shared: OnceLock::new(),
        }
    }

    /// Returns true if the blob arrived as a shared buffer.
    pub fn is_shared(&self) -> bool {
        self.shared_origin
    }

    /// Length of the base64 text, computed without encoding.
    pub fn encoded_len(&self) -> usize {
        match self.encoded.get() {
            Some(encoded) => encoded.len(),
            None => self.size.div_ceil(3) * 4,
        }
    }

    /// Returns the base64 text, encoding from the shared buffer if needed.
    pub fn base64(&self) -> Result<Bytes> {
        if let Some(encoded) = self.encoded.get() {
            return Ok(encoded.clone());
        }
        let shared = self
            .shared
            .get()
            .ok_or_else(|| ServerError::malformed(format!("blob {} has no payload", self.name)))?;
        let encoded = Bytes::from(BASE64_STANDARD.encode(shared.read_all()?));
        Ok(self.encoded.get_or_init(|| encoded).clone())
    }

    /// Returns the shared buffer, decoding base64 into a new one if needed.
    pub fn shared_buffer(&self) -> Result<Arc<SharedBuffer>> {
        if let Some(shared) = self.shared.get() {
            return Ok(shared.clone());
        }
        let encoded = self
            .encoded
            .get()
            .ok_or_else(|| ServerError::malformed(format!("blob {} has no payload", self.name)))?;
        let raw = BASE64_STANDARD.decode(encoded).map_err(|e| {
            ServerError::malformed(format!("blob {} is not valid base64: {}", self.name, e))
        })?;
        let buffer = Arc::new(SharedBuffer::from_bytes(&raw)?);
        Ok(self.shared.get_or_init(|| buffer).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shared_buffer_round_trip() {
        let buffer = SharedBuffer::from_bytes(b"SIMPLE = T").unwrap();
        assert_eq!(buffer.len(), 10);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.read_all().unwrap(), b"SIMPLE = T".to_vec());
    }

    #[test]
    fn test_from_fd_reads_length() {
        let original = SharedBuffer::from_bytes(&[7u8; 1000]).unwrap();
        let dup = original.as_fd().try_clone_to_owned().unwrap();
        let adopted = SharedBuffer::from_fd(dup).unwrap();
        assert_eq!(adopted.len(), 1000);
        assert_eq!(adopted.read_all().unwrap(), vec![7u8; 1000]);
    }

    #[test]
    fn test_base64_strips_whitespace() {
        let blob = BlobAttachment::from_base64("img", ".fits", 5, b"aGVs\n  bG8=\n");
        assert_eq!(blob.base64().unwrap(), Bytes::from_static(b"aGVsbG8="));
        assert_eq!(blob.encoded_len(), 8);
        assert!(!blob.is_shared());
    }

    #[test]
    fn test_base64_to_shared() {
        let blob = BlobAttachment::from_base64("img", ".fits", 5, b"aGVsbG8=");
        let shared = blob.shared_buffer().unwrap();
        assert_eq!(shared.read_all().unwrap(), b"hello".to_vec());

        // Second call reuses the cached buffer.
        let again = blob.shared_buffer().unwrap();
        assert!(Arc::ptr_eq(&shared, &again));
    }

    #[test]
    fn test_shared_to_base64() {
        let buffer = SharedBuffer::from_bytes(b"hello").unwrap();
        let blob = BlobAttachment::from_shared("img", ".fits", buffer);
        assert!(blob.is_shared());
        assert_eq!(blob.size, 5);
        assert_eq!(blob.encoded_len(), 8);
        assert_eq!(blob.base64().unwrap(), Bytes::from_static(b"aGVsbG8="));
        assert!(blob.is_shared());
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let blob = BlobAttachment::from_base64("img", ".fits", 3, b"!!!!");
        let err = blob.shared_buffer().unwrap_err();
        assert!(matches!(err, ServerError::Malformed(_)));
    }

    #[test]
    fn test_from_raw() {
        let blob = BlobAttachment::from_raw("img", ".jpg", b"hello");
        assert_eq!(blob.size, 5);
        assert_eq!(blob.base64().unwrap(), Bytes::from_static(b"aGVsbG8="));
    }
}
