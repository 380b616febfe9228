//! Shared fixtures for integration tests: fake drivers written as shell
//! scripts, a broker on an ephemeral port, and a raw protocol client.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydrogen_server::config::DriverEntry;
use hydrogen_server::transport::{split_tcp, split_unix, PeerRead, PeerWrite};
use hydrogen_server::{BrokerHandle, Server, ServerConfig};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Camera driver: defines `Cam.TEMP` and `Cam.EXPOSE`, answers a temperature
/// command with an update and an exposure with a FITS blob.
pub const CAMERA_DRIVER: &str = r#"
printf '<defNumberVector device="Cam" name="TEMP" state="Idle" perm="rw"><defNumber name="T">20</defNumber></defNumberVector>\n'
printf '<defSwitchVector device="Cam" name="EXPOSE" state="Idle" perm="rw"><defSwitch name="GO">Off</defSwitch></defSwitchVector>\n'
printf '<defBLOBVector device="Cam" name="CCD1" state="Idle" perm="ro"><defBLOB name="CCD1"/></defBLOBVector>\n'
while IFS= read -r line; do
  case "$line" in
    *newNumberVector*)
      printf '<setNumberVector device="Cam" name="TEMP" state="Ok"><oneNumber name="T">-10</oneNumber></setNumberVector>\n' ;;
    *newSwitchVector*)
      printf '<setBLOBVector device="Cam" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="10" format=".fits">U0lNUExFID0gVA==</oneBLOB></setBLOBVector>\n' ;;
  esac
done
"#;

/// Writes a driver script; it is run through `/bin/sh` rather than executed.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Driver entry running `script` under `/bin/sh`.
pub fn sh_driver(name: &str, script: &Path) -> DriverEntry {
    DriverEntry {
        name: Some(name.to_string()),
        binary: Some("/bin/sh".into()),
        args: vec![script.display().to_string()],
        ..Default::default()
    }
}

/// Loopback-only configuration with no Unix socket and fast restarts.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listen.port = 0;
    config.listen.bind_address = "127.0.0.1".to_string();
    config.listen.unix_socket.clear();
    config.drivers.restart_delay_ms = 50;
    config
}

pub struct RunningServer {
    pub addr: SocketAddr,
    pub handle: BrokerHandle,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<hydrogen_server::Result<()>>,
}

impl RunningServer {
    pub async fn start(config: ServerConfig) -> Self {
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            addr,
            handle,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

/// A protocol client speaking raw XML.
pub struct TestClient {
    reader: Box<dyn PeerRead>,
    writer: Box<dyn PeerWrite>,
    pending: Vec<u8>,
    pub fds: VecDeque<OwnedFd>,
}

impl TestClient {
    pub async fn tcp(addr: SocketAddr) -> Self {
        let (reader, writer) = split_tcp(TcpStream::connect(addr).await.unwrap());
        Self::new(reader, writer)
    }

    pub async fn unix(path: &Path) -> Self {
        let (reader, writer) = split_unix(UnixStream::connect(path).await.unwrap());
        Self::new(reader, writer)
    }

    fn new(reader: Box<dyn PeerRead>, writer: Box<dyn PeerWrite>) -> Self {
        Self {
            reader,
            writer,
            pending: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    pub async fn send(&mut self, text: &str) {
        let mut data = text.as_bytes();
        while !data.is_empty() {
            let n = self.writer.write_chunk(data, &[]).await.unwrap();
            data = &data[n..];
        }
    }

    /// Reads until `needle` shows up and returns everything up to and
    /// including it. Later bytes stay buffered for the next call.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let mut buf = vec![0u8; 64 * 1024];
        tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Some(pos) = find(&self.pending, needle.as_bytes()) {
                    let end = pos + needle.len();
                    let head: Vec<u8> = self.pending.drain(..end).collect();
                    return String::from_utf8(head).unwrap();
                }
                let n = self
                    .reader
                    .read_chunk(&mut buf, &mut self.fds)
                    .await
                    .unwrap();
                assert!(n > 0, "connection closed while waiting for {needle:?}");
                self.pending.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {needle:?}; buffered: {}",
                String::from_utf8_lossy(&self.pending)
            )
        })
    }

    /// True if nothing arrives within `quiet`.
    pub async fn is_silent(&mut self, quiet: Duration) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(quiet, self.reader.read_chunk(&mut buf, &mut self.fds)).await {
            Err(_) => true,
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                false
            }
            Ok(Err(_)) => false,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
