use std::future::Future;

use layerd_core::{Engine, SnapshotterLifecycle};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Terminating,
}

/// Waits for the interrupt, then tears down the snapshotter.
///
/// Only the snapshotter is closed; the gRPC listener and server are left to
/// process exit.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: State,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: State::Running,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Block until `interrupt` resolves, then close `lifecycle`.
    pub async fn run<E, F>(&mut self, interrupt: F, lifecycle: SnapshotterLifecycle<E>)
    where
        E: Engine,
        F: Future<Output = ()>,
    {
        interrupt.await;
        self.state = State::Terminating;
        info!("got SIGINT");

        lifecycle.close().await;
        info!("exiting");
    }
}

/// Subscribe to SIGINT and return a future resolving on the first delivery.
///
/// The subscription is live as soon as this returns, so a signal arriving
/// before the future is first polled is not lost.
pub fn interrupt_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(async move {
        sigint.recv().await;
    })
}
