//! Byte transports behind a single async read/write interface.
//!
//! Every connected peer (TCP client, Unix client, local driver, remote
//! broker) is driven through [`PeerRead`] and [`PeerWrite`]. Unix sockets
//! additionally carry file descriptors for shared blob buffers.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UnixStream};

use crate::protocol::SharedBuffer;

/// Most descriptors accepted with one read.
const MAX_FDS_PER_READ: usize = 16;

/// Inbound half of a peer connection.
#[async_trait]
pub trait PeerRead: Send {
    /// Reads bytes into `buf`. Received descriptors are appended to `fds`.
    /// Returns 0 at end of stream.
    async fn read_chunk(&mut self, buf: &mut [u8], fds: &mut VecDeque<OwnedFd>)
        -> io::Result<usize>;
}

/// Outbound half of a peer connection.
#[async_trait]
pub trait PeerWrite: Send {
    /// Returns true if descriptors can be sent.
    fn supports_fds(&self) -> bool;

    /// Writes a prefix of `data`, sending `fds` along with its first byte.
    async fn write_chunk(&mut self, data: &[u8], fds: &[Arc<SharedBuffer>]) -> io::Result<usize>;

    /// Flushes and closes the write direction.
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Plain byte stream reader.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PeerRead for StreamReader<R> {
    async fn read_chunk(
        &mut self,
        buf: &mut [u8],
        _fds: &mut VecDeque<OwnedFd>,
    ) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

/// Plain byte stream writer.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PeerWrite for StreamWriter<W> {
    fn supports_fds(&self) -> bool {
        false
    }

    async fn write_chunk(&mut self, data: &[u8], fds: &[Arc<SharedBuffer>]) -> io::Result<usize> {
        if !fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stream transport cannot carry descriptors",
            ));
        }
        self.inner.write(data).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Unix socket reader receiving descriptors via `SCM_RIGHTS`.
pub struct FdReader {
    half: OwnedReadHalf,
}

#[async_trait]
impl PeerRead for FdReader {
    async fn read_chunk(
        &mut self,
        buf: &mut [u8],
        fds: &mut VecDeque<OwnedFd>,
    ) -> io::Result<usize> {
        let stream: &UnixStream = self.half.as_ref();
        let raw = stream.as_raw_fd();
        loop {
            stream.readable().await?;
            match stream.try_io(Interest::READABLE, || recv_with_fds(raw, buf, fds)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }
}

/// Unix socket writer sending descriptors via `SCM_RIGHTS`.
pub struct FdWriter {
    half: OwnedWriteHalf,
}

#[async_trait]
impl PeerWrite for FdWriter {
    fn supports_fds(&self) -> bool {
        true
    }

    async fn write_chunk(&mut self, data: &[u8], fds: &[Arc<SharedBuffer>]) -> io::Result<usize> {
        if fds.is_empty() {
            return self.half.write(data).await;
        }
        let raw_fds: Vec<RawFd> = fds.iter().map(|b| b.as_raw_fd()).collect();
        let stream: &UnixStream = self.half.as_ref();
        let raw = stream.as_raw_fd();
        loop {
            stream.writable().await?;
            match stream.try_io(Interest::WRITABLE, || send_with_fds(raw, data, &raw_fds)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                result => return result,
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), recv_flags())?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel installed these descriptors for us.
                fds.push_back(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "too many descriptors in one message",
        ));
    }
    Ok(msg.bytes)
}

fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    Ok(sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?)
}

#[cfg(target_os = "linux")]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// Boxed reader/writer pair.
pub type PeerHalves = (Box<dyn PeerRead>, Box<dyn PeerWrite>);

/// Splits a TCP connection.
pub fn split_tcp(stream: TcpStream) -> PeerHalves {
    let (read, write) = stream.into_split();
    (
        Box::new(StreamReader::new(read)),
        Box::new(StreamWriter::new(write)),
    )
}

/// Splits a Unix connection; both halves can carry descriptors.
pub fn split_unix(stream: UnixStream) -> PeerHalves {
    let (read, write) = stream.into_split();
    (Box::new(FdReader { half: read }), Box::new(FdWriter { half: write }))
}

/// Creates a connected socket pair: one end for the broker, one for a child.
pub fn socket_pair() -> io::Result<(UnixStream, std::os::unix::net::UnixStream)> {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
    ours.set_nonblocking(true)?;
    Ok((UnixStream::from_std(ours)?, theirs))
}
