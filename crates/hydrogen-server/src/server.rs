//! Startup wiring: listeners, configured drivers and the broker loop.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerHandle};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::listener::{AcceptContext, FifoListener, TcpServer, UnixServer};

/// A bound, not yet running broker.
///
/// Binding happens in [`Server::bind`] so that an unusable address stops the
/// process before any driver is launched.
pub struct Server {
    config: ServerConfig,
    broker: Broker,
    tcp: TcpServer,
    unix: Option<UnixServer>,
    fifo: Option<FifoListener>,
}

impl Server {
    /// Validates `config` and binds every listener.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let tcp = TcpServer::bind(&config.tcp_endpoint()).await?;
        let unix = config
            .unix_socket_path()
            .map(UnixServer::bind)
            .transpose()?;
        let fifo = config
            .listen
            .fifo
            .as_ref()
            .map(FifoListener::bind)
            .transpose()?;
        let broker = Broker::new(config.limits.max_connections, config.driver_settings());

        Ok(Self {
            config,
            broker,
            tcp,
            unix,
            fifo,
        })
    }

    /// TCP address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn unix_path(&self) -> Option<&Path> {
        self.unix.as_ref().map(|u| u.path())
    }

    pub fn handle(&self) -> BrokerHandle {
        self.broker.handle()
    }

    /// Starts the configured drivers and serves until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Server {
            config,
            mut broker,
            tcp,
            unix,
            fifo,
        } = self;

        for spec in config.driver_specs()? {
            let name = spec.name().to_string();
            if let Err(e) = broker.start_driver(spec) {
                warn!(driver = %name, error = %e, "Driver did not start");
            }
        }

        let ctx = AcceptContext {
            handle: broker.handle(),
            limits: config.queue_limits(),
        };
        let mut listeners = JoinSet::new();
        listeners.spawn(tcp.run(ctx.clone(), shutdown.clone()));
        if let Some(unix) = unix {
            listeners.spawn(unix.run(ctx.clone(), shutdown.clone()));
        }
        if let Some(fifo) = fifo {
            listeners.spawn(fifo.run(broker.handle(), shutdown.clone()));
        }

        broker.run(shutdown.clone()).await;
        shutdown.cancel();

        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Listener task failed");
            }
        }
        info!("Server stopped");
        Ok(())
    }
}
