//! Error types for the broker.
//!
//! Errors are classified the way the broker contains them: transient peer
//! errors discard one unit and keep the connection, fatal peer errors tear
//! down one connection or driver, and only startup errors stop the process.

use std::io;
use std::path::PathBuf;

use hydrogen_common::CommonError;
use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Broker errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration file or command line problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not bind a listener. Process-fatal at startup.
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        /// Address or path that failed.
        endpoint: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Well-formed XML that is not a valid protocol message.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Byte stream is no longer parseable.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Message names a device nobody owns.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Bad administrative command.
    #[error("Invalid command '{line}': {reason}")]
    Command {
        /// The offending line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Driver lifecycle failure (spawn error, crash loop, connect failure).
    #[error("Driver '{driver}': {reason}")]
    Driver {
        /// Driver name.
        driver: String,
        /// What happened.
        reason: String,
    },

    /// Peer exceeded its queue budget.
    #[error("Queue limit exceeded for {peer}: {queued} bytes queued")]
    Overflow {
        /// Peer label.
        peer: String,
        /// Bytes queued when the limit tripped.
        queued: usize,
    },

    /// Too many clients are connected.
    #[error("Connection limit of {0} clients reached")]
    ConnectionLimit(usize),

    /// Shared blob buffer could not be created or mapped.
    #[error("Shared buffer error at {path:?}: {source}")]
    SharedBuffer {
        /// Backing path, if any.
        path: Option<PathBuf>,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Process supervision error.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Generic IO failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a bind error.
    pub fn bind(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Creates a malformed-message error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Creates a framing error.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Creates a command error.
    pub fn command(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Creates a driver lifecycle error.
    pub fn driver(driver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Driver {
            driver: driver.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error must tear down the peer that caused it.
    ///
    /// Transient errors (malformed message, unknown device, bad command)
    /// only discard the offending unit.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Malformed(_)
            | ServerError::UnknownDevice(_)
            | ServerError::Command { .. }
            | ServerError::Config(_) => false,
            ServerError::Bind { .. }
            | ServerError::Framing(_)
            | ServerError::Driver { .. }
            | ServerError::Overflow { .. }
            | ServerError::ConnectionLimit(_)
            | ServerError::SharedBuffer { .. }
            | ServerError::Common(_)
            | ServerError::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::malformed("missing device attribute");
        assert_eq!(err.to_string(), "Malformed message: missing device attribute");

        let err = ServerError::command("frobnicate", "unknown command");
        assert_eq!(
            err.to_string(),
            "Invalid command 'frobnicate': unknown command"
        );

        let err = ServerError::driver("indi_simulator_ccd", "restart limit reached");
        assert_eq!(
            err.to_string(),
            "Driver 'indi_simulator_ccd': restart limit reached"
        );
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::bind(
            "0.0.0.0:7624",
            io::Error::new(io::ErrorKind::AddrInUse, "Address in use"),
        );
        assert_eq!(err.to_string(), "Failed to bind 0.0.0.0:7624: Address in use");
    }

    #[test]
    fn test_is_fatal() {
        assert!(!ServerError::malformed("x").is_fatal());
        assert!(!ServerError::UnknownDevice("Cam".into()).is_fatal());
        assert!(!ServerError::command("x", "y").is_fatal());

        assert!(ServerError::framing("unbalanced").is_fatal());
        assert!(ServerError::Overflow {
            peer: "client".into(),
            queued: 1
        }
        .is_fatal());
        assert!(ServerError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
    }

    #[test]
    fn test_from_common_error() {
        let err: ServerError = CommonError::AlreadyExited {
            label: "ccd".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Process 'ccd' has already exited");
    }
}
