//! Error types for the daemon bootstrap and the snapshotter engine.

use std::path::PathBuf;

use containerd_snapshots::tonic::Status;
use thiserror::Error;

/// Tracing target for records that end the process.
///
/// Only records with this target pass the `fatal` and `panic` log levels.
pub const FATAL_TARGET: &str = "layerd::fatal";

/// Errors raised while bootstrapping or tearing down the daemon.
///
/// Every variant except [`DaemonError::ShutdownClose`] is fatal: the caller
/// logs it and exits the process with a non-zero status.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The configuration file could not be read or decoded.
    #[error("failed to load config file {path:?}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    /// The requested log level is not one of the supported severities.
    #[error("invalid log level {0:?} (expected one of trace, debug, info, warn, error, fatal, panic)")]
    LogLevelParse(String),

    /// The process-wide logger could not be installed.
    #[error("failed to install logger: {0}")]
    LoggerInstall(String),

    /// The snapshotter engine failed to initialise.
    #[error("failed to configure snapshotter: {0}")]
    SnapshotterInit(#[source] SnapshotError),

    /// The socket's parent directory could not be created.
    #[error("failed to create directory {path:?}: {source}")]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stale file at the socket path could not be removed.
    #[error("failed to remove {path:?}: {source}")]
    SocketCleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Binding the Unix socket failed.
    #[error("error on listen socket {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The gRPC accept loop terminated with an error.
    #[error("error on serving via socket {path:?}: {reason}")]
    Serve { path: PathBuf, reason: String },

    /// Closing the snapshotter during shutdown failed (non-fatal).
    #[error("failed to close snapshotter: {0}")]
    ShutdownClose(#[source] SnapshotError),
}

impl DaemonError {
    /// Name of the bootstrap operation that produced this error.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::ConfigLoad { .. } => "load_config",
            Self::LogLevelParse(_) | Self::LoggerInstall(_) => "prepare_logger",
            Self::SnapshotterInit(_) => "construct_snapshotter",
            Self::DirectoryCreate { .. } => "create_socket_dir",
            Self::SocketCleanup { .. } => "remove_stale_socket",
            Self::Listen { .. } => "listen",
            Self::Serve { .. } => "serve",
            Self::ShutdownClose(_) => "close_snapshotter",
        }
    }

    /// Whether the error must terminate the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ShutdownClose(_))
    }
}

/// Errors produced by the snapshotter engine.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// No snapshot with the given key exists.
    #[error("snapshot {0} not found")]
    NotFound(String),

    /// A snapshot with the given key already exists.
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),

    /// The snapshot is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine has been closed.
    #[error("snapshotter is closed")]
    Closed,

    /// Persisted metadata is inconsistent with the on-disk layout.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialisation/deserialisation error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SnapshotError> for Status {
    fn from(err: SnapshotError) -> Self {
        let msg = err.to_string();
        match err {
            SnapshotError::NotFound(_) => Status::not_found(msg),
            SnapshotError::AlreadyExists(_) => Status::already_exists(msg),
            SnapshotError::FailedPrecondition(_) => Status::failed_precondition(msg),
            SnapshotError::InvalidArgument(_) => Status::invalid_argument(msg),
            SnapshotError::Closed => Status::unavailable(msg),
            SnapshotError::Metadata(_) | SnapshotError::Io(_) | SnapshotError::Json(_) => {
                Status::internal(msg)
            }
        }
    }
}

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, SnapshotError>;
