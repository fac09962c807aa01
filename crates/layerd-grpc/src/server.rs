use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use containerd_snapshots::tonic::transport::Server;
use containerd_snapshots::Snapshotter;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::Stream;
use tracing::{error, info};

use layerd_core::{DaemonError, FATAL_TARGET};

/// Handle to the background serve task.
///
/// The task runs for the rest of the process; dropping the handle detaches it.
pub struct ServerHandle {
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Socket the server is accepting on.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Whether the serve task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Serve `snapshotter` as the containerd snapshots service on `listener`.
///
/// Resolves only when the accept loop stops.
pub async fn serve<S: Snapshotter>(
    listener: UnixListener,
    snapshotter: Arc<S>,
    socket: &Path,
) -> Result<(), DaemonError> {
    serve_incoming(UnixListenerStream::new(listener), snapshotter, socket).await
}

/// Serve over an arbitrary stream of accepted connections.
///
/// An accept error from `incoming` stops the server and is reported as
/// [`DaemonError::Serve`].
pub async fn serve_incoming<S, I>(
    incoming: I,
    snapshotter: Arc<S>,
    socket: &Path,
) -> Result<(), DaemonError>
where
    S: Snapshotter,
    I: Stream<Item = io::Result<UnixStream>> + Send + 'static,
{
    Server::builder()
        .add_service(containerd_snapshots::server(snapshotter))
        .serve_with_incoming(incoming)
        .await
        .map_err(|e| DaemonError::Serve {
            path: socket.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Log a serve failure at fatal severity and return the exit status to use.
pub fn report_serve_failure(err: &DaemonError) -> i32 {
    error!(
        target: FATAL_TARGET,
        severity = "fatal",
        op = err.operation(),
        error = %err,
        "gRPC server stopped"
    );
    1
}

/// Run [`serve`] on a background task.
///
/// A serve failure ends the process: it is logged at fatal severity and the
/// process exits with status 1.
pub fn spawn<S: Snapshotter>(
    listener: UnixListener,
    snapshotter: Arc<S>,
    socket: &Path,
) -> ServerHandle {
    let socket = socket.to_path_buf();
    let task = {
        let socket = socket.clone();
        tokio::spawn(async move {
            info!(socket = %socket.display(), "gRPC server started");
            if let Err(e) = serve(listener, snapshotter, &socket).await {
                std::process::exit(report_serve_failure(&e));
            }
        })
    };
    ServerHandle { socket, task }
}
