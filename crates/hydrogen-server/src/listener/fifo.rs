use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::{AdminCommand, AdminEvent};
use crate::broker::BrokerHandle;
use crate::error::{Result, ServerError};

/// Administrative command FIFO. One command per line.
#[derive(Debug)]
pub struct FifoListener {
    path: PathBuf,
}

impl FifoListener {
    /// Creates the FIFO if missing. An existing non-FIFO file is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let endpoint = path.display().to_string();

        match std::fs::metadata(&path) {
            Ok(meta) => {
                use std::os::unix::fs::FileTypeExt;
                if !meta.file_type().is_fifo() {
                    return Err(ServerError::bind(
                        endpoint,
                        io::Error::new(io::ErrorKind::AlreadyExists, "not a FIFO"),
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600))
                    .map_err(|e| ServerError::bind(&endpoint, io::Error::from(e)))?;
            }
            Err(e) => return Err(ServerError::bind(endpoint, e)),
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads commands until `shutdown`. Writers may come and go.
    pub async fn run(self, handle: BrokerHandle, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Reading admin commands");
        loop {
            let receiver = match open_receiver(&self.path) {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Cannot open FIFO");
                    return;
                }
            };
            let mut lines = BufReader::new(receiver).lines();

            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if !submit(&handle, line.trim()).await {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "FIFO read failed");
                        break;
                    }
                }
            }

            // All writers went away; wait for the next one.
            debug!("FIFO writer closed");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(super::ACCEPT_BACKOFF) => {}
            }
        }
    }
}

/// Parses and forwards one line. Returns false once the broker is gone.
async fn submit(handle: &BrokerHandle, line: &str) -> bool {
    if line.is_empty() || line.starts_with('#') {
        return true;
    }
    match AdminCommand::parse(line) {
        Ok(command) => handle.command(command).await,
        Err(e) => {
            warn!(error = %e, "Ignoring admin command");
            let reason = match e {
                ServerError::Command { reason, .. } => reason,
                other => other.to_string(),
            };
            handle.publish(AdminEvent::CommandRejected {
                line: line.to_string(),
                reason,
            });
            true
        }
    }
}

/// Opening read-write keeps the FIFO from reporting end-of-file between writers.
#[cfg(target_os = "linux")]
fn open_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().read_write(true).open_receiver(path)
}

#[cfg(not(target_os = "linux"))]
fn open_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path)
}
