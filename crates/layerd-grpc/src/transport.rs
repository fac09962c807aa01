use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::{debug, info};

use layerd_core::DaemonError;

/// Prepare `socket_path` and bind a listener on it.
///
/// Creates the parent directory (mode `0700`) if missing, removes whatever a
/// previous run left at the path, then binds. No step is retried.
pub fn provision(socket_path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|source| DaemonError::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    remove_stale(socket_path).map_err(|source| DaemonError::SocketCleanup {
        path: socket_path.to_path_buf(),
        source,
    })?;

    let listener = UnixListener::bind(socket_path).map_err(|source| DaemonError::Listen {
        path: PathBuf::from(socket_path),
        source,
    })?;
    info!(socket = %socket_path.display(), "listening on Unix socket");
    Ok(listener)
}

/// Remove anything at `path`, whatever its type. Absence is not an error.
fn remove_stale(path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    debug!(path = %path.display(), "removing stale socket path");
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
