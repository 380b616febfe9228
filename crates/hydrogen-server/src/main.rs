//! hydrogenserver entry point.
//!
//! Parses the command line, loads the configuration file, binds every
//! listener and runs the broker until SIGINT or SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use hydrogen_server::config::DriverEntry;
use hydrogen_server::{Server, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Device-control message broker
#[derive(Parser, Debug)]
#[command(name = "hydrogenserver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Unix socket path (empty to disable)
    #[arg(short = 'u', long = "unix-socket")]
    unix_socket: Option<String>,

    /// Administrative FIFO path
    #[arg(short = 'f', long)]
    fifo: Option<PathBuf>,

    /// Max ordinary backlog per peer, in MB
    #[arg(short = 'm', long)]
    maxqsiz: Option<usize>,

    /// Max blob backlog per peer, in MB
    #[arg(short = 'd', long)]
    maxstreamsiz: Option<usize>,

    /// Max driver restarts within the restart window
    #[arg(short = 'r', long)]
    maxrestarts: Option<u32>,

    /// Configuration file
    #[arg(short = 'c', long, default_value = "/etc/hydrogen/hydrogenserver.toml")]
    config: PathBuf,

    /// More logging (-v debug). RUST_LOG takes precedence.
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Drivers: executable paths or device@host[:port]
    drivers: Vec<String>,
}

impl Args {
    /// Applies command line overrides on top of the file configuration.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(path) = &self.unix_socket {
            config.listen.unix_socket = path.clone();
        }
        if let Some(path) = &self.fifo {
            config.listen.fifo = Some(path.clone());
        }
        if let Some(mb) = self.maxqsiz {
            config.limits.max_queue_mb = mb;
        }
        if let Some(mb) = self.maxstreamsiz {
            config.limits.max_stream_mb = mb;
        }
        if let Some(n) = self.maxrestarts {
            config.drivers.max_restarts = n;
        }
        for driver in &self.drivers {
            let entry = if driver.contains('@') {
                DriverEntry {
                    remote: Some(driver.clone()),
                    ..Default::default()
                }
            } else {
                DriverEntry {
                    binary: Some(driver.into()),
                    ..Default::default()
                }
            };
            config.driver_entries.push(entry);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config = ServerConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config);

    let server = Server::bind(config).await.context("startup failed")?;
    info!(addr = ?server.local_addr().ok(), unix = ?server.unix_path(), "hydrogenserver started");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    if let Err(e) = server.run(shutdown).await {
        error!(error = %e, "hydrogenserver exiting with error");
        return Err(e.into());
    }
    info!("hydrogenserver exiting normally");
    Ok(())
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "hydrogenserver",
            "-p",
            "7625",
            "-m",
            "64",
            "-vv",
            "/usr/bin/indi_simulator_ccd",
            "Telescope@mount.local",
        ])
        .unwrap();
        assert_eq!(args.port, Some(7625));
        assert_eq!(args.maxqsiz, Some(64));
        assert_eq!(args.verbose, 2);
        assert_eq!(args.drivers.len(), 2);
    }

    #[test]
    fn test_apply_overrides() {
        let args = Args::try_parse_from([
            "hydrogenserver",
            "-u",
            "",
            "-d",
            "10",
            "-r",
            "0",
            "/usr/bin/indi_simulator_ccd",
            "Telescope@mount.local:7625",
        ])
        .unwrap();
        let mut config = ServerConfig::default();
        args.apply(&mut config);

        assert_eq!(config.unix_socket_path(), None);
        assert_eq!(config.limits.max_stream_mb, 10);
        assert_eq!(config.drivers.max_restarts, 0);
        assert_eq!(config.listen.port, 7624);

        let specs = config.driver_specs().unwrap();
        assert_eq!(specs[0].name(), "indi_simulator_ccd");
        assert!(specs[1].is_remote());
    }
}
