//! Error types for the common building blocks.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for common operations.
pub type CommonResult<T> = Result<T, CommonError>;

/// Errors that can occur while supervising child processes.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Failed to spawn a child process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// The program that failed to start.
        program: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The child process was already reaped.
    #[error("Process '{label}' has already exited")]
    AlreadyExited {
        /// Label of the process.
        label: String,
    },

    /// Generic IO failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CommonError {
    /// Creates a spawn error.
    pub fn spawn(program: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// A missing binary or a permission problem will not fix itself, but
    /// resource exhaustion (EAGAIN, EMFILE) can.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommonError::Spawn { source, .. } | CommonError::Io(source) => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            CommonError::AlreadyExited { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = CommonError::spawn(
            "/usr/bin/indi_simulator_ccd",
            io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        );
        assert_eq!(
            err.to_string(),
            "Failed to spawn '/usr/bin/indi_simulator_ccd': No such file or directory"
        );
    }

    #[test]
    fn test_is_retryable() {
        let missing = CommonError::spawn("/nope", io::Error::from(io::ErrorKind::NotFound));
        assert!(!missing.is_retryable());

        let busy = CommonError::spawn("/bin/true", io::Error::from(io::ErrorKind::WouldBlock));
        assert!(busy.is_retryable());

        let gone = CommonError::AlreadyExited {
            label: "ccd".to_string(),
        };
        assert!(!gone.is_retryable());
    }
}
