//! Common error types for keller.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KellerError`].
pub type KellerResult<T> = Result<T, KellerError>;

/// Errors across the manager.
///
/// The lifecycle state machine reports these through the log and then
/// signals progress with a [`crate::runtime::Stage`]; errors never drive
/// the unwind themselves.
#[derive(Error, Diagnostic, Debug)]
pub enum KellerError {
    /// Configuration could not be read or decoded.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(keller::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// The build-root configuration file failed the ownership pre-flight.
    #[error("{path} refused: {reason}")]
    #[diagnostic(
        code(keller::config::insecure),
        help("the file must be a regular file owned by root and writable only by root")
    )]
    Insecure {
        /// The offending file.
        path: PathBuf,
        /// Why it was refused.
        reason: String,
    },

    /// A mount syscall failed.
    #[error("Failed to mount {target}: {source}")]
    #[diagnostic(code(keller::mount))]
    Mount {
        /// The mount target.
        target: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An unmount syscall failed.
    #[error("Failed to unmount {target}: {source}")]
    #[diagnostic(code(keller::unmount))]
    Unmount {
        /// The mount target.
        target: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Ledger I/O or locking failed.
    #[error("Ledger error: {message}")]
    #[diagnostic(code(keller::ledger))]
    Ledger {
        /// The error message.
        message: String,
    },

    /// Entering fresh namespaces failed.
    #[error("Failed to unshare namespaces: {source}")]
    #[diagnostic(code(keller::namespace))]
    Unshare {
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Installing a signal handler failed.
    #[error("Failed to install a signal handler: {source}")]
    #[diagnostic(code(keller::signal))]
    Signal {
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Spawning the child command failed.
    #[error("Failed to spawn the command: {message}")]
    #[diagnostic(code(keller::spawn))]
    Spawn {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keller::io))]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KellerError::Ledger {
            message: "short write".to_string(),
        };
        assert_eq!(err.to_string(), "Ledger error: short write");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KellerError = io_err.into();
        assert!(matches!(err, KellerError::Io(_)));
    }
}
