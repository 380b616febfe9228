use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AcceptContext, ACCEPT_BACKOFF};
use crate::error::{Result, ServerError};
use crate::protocol::Requirements;
use crate::transport::split_tcp;

/// TCP listener for clients.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Binds `endpoint` (`host:port`). Failure is fatal at startup.
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let listener = TcpListener::bind(endpoint)
            .await
            .map_err(|e| ServerError::bind(endpoint, e))?;
        Ok(Self { listener })
    }

    /// Bound address; reveals the port when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, ctx: AcceptContext, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Listening for TCP clients");
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, error = %e, "set_nodelay failed");
            }
            if !ctx
                .admit(addr.to_string(), Requirements::INLINE, split_tcp(stream))
                .await
            {
                break;
            }
        }
        debug!("TCP listener stopped");
    }
}
