use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcceptContext, ACCEPT_BACKOFF};
use crate::error::{Result, ServerError};
use crate::protocol::Requirements;
use crate::transport::split_unix;

/// Unix socket listener for local clients. The socket file is removed when
/// the server is dropped.
#[derive(Debug)]
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixServer {
    /// Binds `path`, replacing a stale socket file left by a dead server.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let endpoint = path.display().to_string();

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(ServerError::bind(
                    endpoint,
                    io::Error::new(io::ErrorKind::AddrInUse, "another server is listening"),
                ));
            }
            debug!(path = %endpoint, "Removing stale socket");
            fs::remove_file(&path).map_err(|e| ServerError::bind(&endpoint, e))?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| ServerError::bind(&endpoint, e))?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(self, ctx: AcceptContext, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Listening for Unix clients");
        let mut serial = 0u64;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Unix accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            serial += 1;
            let label = format!("unix#{serial}");
            if !ctx
                .admit(label, Requirements::SHARED, split_unix(stream))
                .await
            {
                break;
            }
        }
        debug!("Unix listener stopped");
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Socket file not removed");
        }
    }
}
