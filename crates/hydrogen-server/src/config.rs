//! Configuration file support.
//!
//! Loads and validates broker configuration from TOML. Every field has a
//! default, so an empty or missing file yields a working broker listening
//! on port 7624. Command line flags are applied on top by the binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::{DriverSettings, DriverSpec};
use crate::error::{Result, ServerError};
use crate::queue::QueueLimits;

const MB: usize = 1024 * 1024;

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// TCP port. 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP bind address.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Unix socket path. Empty disables the Unix listener.
    #[serde(default = "default_unix_socket")]
    pub unix_socket: String,

    /// Administrative FIFO path.
    #[serde(default)]
    pub fifo: Option<PathBuf>,
}

/// Queue and input limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Ordinary backlog per peer before it is torn down, in megabytes.
    #[serde(default = "default_max_queue_mb")]
    pub max_queue_mb: usize,

    /// Blob backlog per peer before new blobs are dropped, in megabytes.
    #[serde(default = "default_max_stream_mb")]
    pub max_stream_mb: usize,

    /// Concurrently connected clients.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest inbound element.
    #[serde(default = "default_max_element_bytes")]
    pub max_element_bytes: usize,
}

/// Driver supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriversConfig {
    /// Unexpected exits tolerated inside the restart window. 0 disables restarts.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Restart observation window in seconds.
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,

    /// Delay before a crashed driver is relaunched, in milliseconds.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Time a new driver has to send its first message, in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Remote broker connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// One `[[driver]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEntry {
    /// Driver name; defaults to the binary file name.
    #[serde(default)]
    pub name: Option<String>,

    /// Local driver executable.
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Extra arguments for the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Skeleton file passed as `INDISKEL`.
    #[serde(default)]
    pub skeleton: Option<PathBuf>,

    /// Driver config file passed as `INDICONFIG`.
    #[serde(default)]
    pub config: Option<PathBuf>,

    /// Remote proxy target, `device@host[:port]`.
    #[serde(default)]
    pub remote: Option<String>,
}

/// Complete broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub drivers: DriversConfig,

    #[serde(default, rename = "driver")]
    pub driver_entries: Vec<DriverEntry>,
}

fn default_port() -> u16 {
    7624
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_unix_socket() -> String {
    "/tmp/hydrogenserver".to_string()
}

fn default_max_queue_mb() -> usize {
    128
}

fn default_max_stream_mb() -> usize {
    5
}

fn default_max_connections() -> usize {
    256
}

fn default_max_element_bytes() -> usize {
    64 * MB
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_window() -> u64 {
    60
}

fn default_restart_delay() -> u64 {
    500
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            unix_socket: default_unix_socket(),
            fifo: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queue_mb: default_max_queue_mb(),
            max_stream_mb: default_max_stream_mb(),
            max_connections: default_max_connections(),
            max_element_bytes: default_max_element_bytes(),
        }
    }
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            restart_delay_ms: default_restart_delay(),
            handshake_timeout_secs: default_handshake_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `path`, falling back to defaults if the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                ServerError::config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    /// Unix socket path, if the Unix listener is enabled.
    pub fn unix_socket_path(&self) -> Option<PathBuf> {
        if self.listen.unix_socket.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.listen.unix_socket))
        }
    }

    /// TCP listen address as `host:port`.
    pub fn tcp_endpoint(&self) -> String {
        format!("{}:{}", self.listen.bind_address, self.listen.port)
    }

    /// Per-peer queue budgets.
    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_queue_bytes: self.limits.max_queue_mb.saturating_mul(MB),
            max_stream_bytes: self.limits.max_stream_mb.saturating_mul(MB),
        }
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.drivers.restart_window_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.drivers.restart_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.drivers.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.drivers.connect_timeout_secs)
    }

    /// Settings handed to the driver manager.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            max_restarts: self.drivers.max_restarts,
            restart_window: self.restart_window(),
            restart_delay: self.restart_delay(),
            handshake_timeout: self.handshake_timeout(),
            connect_timeout: self.connect_timeout(),
            limits: self.queue_limits(),
            max_element_bytes: self.limits.max_element_bytes,
        }
    }

    /// Converts the `[[driver]]` entries into launchable specs.
    pub fn driver_specs(&self) -> Result<Vec<DriverSpec>> {
        self.driver_entries.iter().map(DriverEntry::to_spec).collect()
    }

    /// Validates configuration.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_queue_mb == 0 {
            return Err(ServerError::config("max_queue_mb must be > 0"));
        }

        if self.limits.max_stream_mb == 0 {
            return Err(ServerError::config("max_stream_mb must be > 0"));
        }

        if self.limits.max_connections == 0 {
            return Err(ServerError::config("max_connections must be > 0"));
        }

        if self.limits.max_element_bytes < 1024 {
            return Err(ServerError::config("max_element_bytes must be >= 1024"));
        }

        if self.drivers.restart_window_secs == 0 && self.drivers.max_restarts > 0 {
            return Err(ServerError::config(
                "restart_window_secs must be > 0 when restarts are enabled",
            ));
        }

        if self.drivers.handshake_timeout_secs == 0 {
            return Err(ServerError::config("handshake_timeout_secs must be > 0"));
        }

        let specs = self.driver_specs()?;
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|other| other.name() == spec.name()) {
                return Err(ServerError::config(format!(
                    "duplicate driver name '{}'",
                    spec.name()
                )));
            }
        }

        Ok(())
    }
}

impl DriverEntry {
    /// Builds the driver spec described by this entry.
    pub fn to_spec(&self) -> Result<DriverSpec> {
        match (&self.binary, &self.remote) {
            (Some(binary), None) => {
                let mut spec = DriverSpec::local(binary).with_args(self.args.clone());
                if let Some(name) = &self.name {
                    spec = spec.with_device_name(name);
                }
                if let Some(skeleton) = &self.skeleton {
                    spec = spec.with_skeleton(skeleton);
                }
                if let Some(config) = &self.config {
                    spec = spec.with_config(config);
                }
                Ok(spec)
            }
            (None, Some(remote)) => DriverSpec::parse_remote(remote),
            (Some(_), Some(_)) => Err(ServerError::config(
                "driver entry cannot have both binary and remote",
            )),
            (None, None) => Err(ServerError::config(
                "driver entry needs a binary or a remote target",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverTarget;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port, 7624);
        assert_eq!(config.listen.bind_address, "0.0.0.0");
        assert_eq!(config.listen.unix_socket, "/tmp/hydrogenserver");
        assert!(config.listen.fifo.is_none());
        assert!(config.driver_entries.is_empty());
    }

    #[test]
    fn test_limits_defaults() {
        let config = LimitsConfig::default();
        assert_eq!(config.max_queue_mb, 128);
        assert_eq!(config.max_stream_mb, 5);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.max_element_bytes, 64 * MB);
    }

    #[test]
    fn test_drivers_defaults() {
        let config = DriversConfig::default();
        assert_eq!(config.max_restarts, 10);
        assert_eq!(config.restart_window_secs, 60);
        assert_eq!(config.restart_delay_ms, 500);
    }

    #[test]
    fn test_duration_accessors() {
        let config = ServerConfig::default();
        assert_eq!(config.restart_window(), Duration::from_secs(60));
        assert_eq!(config.restart_delay(), Duration::from_millis(500));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_queue_limits() {
        let limits = ServerConfig::default().queue_limits();
        assert_eq!(limits.max_queue_bytes, 128 * MB);
        assert_eq!(limits.max_stream_bytes, 5 * MB);
        assert_eq!(limits, QueueLimits::default());
    }

    #[test]
    fn test_unix_socket_disabled() {
        let mut config = ServerConfig::default();
        assert_eq!(
            config.unix_socket_path(),
            Some(PathBuf::from("/tmp/hydrogenserver"))
        );
        config.listen.unix_socket.clear();
        assert_eq!(config.unix_socket_path(), None);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_queue() {
        let mut config = ServerConfig::default();
        config.limits.max_queue_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_restart_window() {
        let mut config = ServerConfig::default();
        config.drivers.restart_window_secs = 0;
        assert!(config.validate().is_err());

        config.drivers.max_restarts = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[listen]
port = 7625
fifo = "/tmp/hydrogenfifo"

[limits]
max_stream_mb = 20

[[driver]]
binary = "/usr/bin/indi_simulator_ccd"
name = "CCD Simulator"
skeleton = "/usr/share/indi/ccd_sk.xml"

[[driver]]
remote = "Telescope@observatory.local:7625"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen.port, 7625);
        assert_eq!(config.listen.fifo, Some(PathBuf::from("/tmp/hydrogenfifo")));
        assert_eq!(config.limits.max_stream_mb, 20);
        // Unspecified values use defaults
        assert_eq!(config.limits.max_queue_mb, 128);
        assert_eq!(config.listen.bind_address, "0.0.0.0");

        let specs = config.driver_specs().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name(), "CCD Simulator");
        match specs[0].target() {
            DriverTarget::Local { skeleton, .. } => {
                assert_eq!(
                    skeleton.as_deref(),
                    Some(Path::new("/usr/share/indi/ccd_sk.xml"))
                );
            }
            other => panic!("unexpected target {other:?}"),
        }
        assert!(specs[1].is_remote());
        assert_eq!(specs[1].name(), "Telescope@observatory.local:7625");
    }

    #[test]
    fn test_driver_entry_needs_one_target() {
        let entry = DriverEntry::default();
        assert!(entry.to_spec().is_err());

        let entry = DriverEntry {
            binary: Some("/bin/true".into()),
            remote: Some("Cam@host".into()),
            ..Default::default()
        };
        assert!(entry.to_spec().is_err());
    }

    #[test]
    fn test_validate_duplicate_driver() {
        let mut config = ServerConfig::default();
        let entry = DriverEntry {
            binary: Some("/usr/bin/indi_simulator_ccd".into()),
            ..Default::default()
        };
        config.driver_entries = vec![entry.clone(), entry];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[drivers]\nmax_restarts = 3").unwrap();

        let config = ServerConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.drivers.max_restarts, 3);
        assert_eq!(config.drivers.restart_delay_ms, 500);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits\nmax_queue_mb = ").unwrap();

        let err = ServerConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = ServerConfig::load_or_default("/nonexistent/hydrogen.toml").unwrap();
        assert_eq!(config.listen.port, 7624);
    }
}
