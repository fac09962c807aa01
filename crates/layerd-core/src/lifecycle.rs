//! Construction and teardown of the snapshotter engine.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{DaemonError, Result};

/// A snapshotter engine the daemon can open and close.
#[async_trait]
pub trait Engine: Sized + Send + Sync + 'static {
    /// Open the engine rooted at `root`.
    fn open(root: &Path, config: &Config) -> Result<Self>;

    /// Release engine resources. Called once, at shutdown.
    async fn close(&self) -> Result<()>;
}

/// Sole owner of the snapshotter instance for the life of the process.
pub struct SnapshotterLifecycle<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> SnapshotterLifecycle<E> {
    /// Construct the engine. Any engine error is fatal to the bootstrap.
    pub fn construct(root: &Path, config: &Config) -> std::result::Result<Self, DaemonError> {
        let engine = E::open(root, config).map_err(DaemonError::SnapshotterInit)?;
        Ok(Self::from_engine(engine))
    }

    /// Wrap an already-opened engine.
    pub fn from_engine(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Shared handle for the gRPC adapter.
    pub fn handle(&self) -> Arc<E> {
        Arc::clone(&self.engine)
    }

    /// Close the engine. Failures are logged and swallowed; taking `self`
    /// makes a second close impossible.
    pub async fn close(self) {
        debug!("closing the snapshotter");
        if let Err(e) = self.engine.close().await {
            let err = DaemonError::ShutdownClose(e);
            error!(op = err.operation(), error = %err, "snapshotter close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::SnapshotError;

    struct CountingEngine {
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Engine for CountingEngine {
        fn open(root: &Path, _config: &Config) -> Result<Self> {
            if !root.is_dir() {
                return Err(SnapshotError::NotFound(root.display().to_string()));
            }
            Ok(Self {
                closes: Arc::new(AtomicUsize::new(0)),
                fail: false,
            })
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SnapshotError::Closed);
            }
            Ok(())
        }
    }

    #[test]
    fn construct_failure_is_snapshotter_init() {
        let err = SnapshotterLifecycle::<CountingEngine>::construct(
            Path::new("/no/such/root"),
            &Config::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DaemonError::SnapshotterInit(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn close_failure_is_swallowed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let lifecycle = SnapshotterLifecycle::from_engine(CountingEngine {
            closes: Arc::clone(&closes),
            fail: true,
        });
        let handle = lifecycle.handle();

        lifecycle.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&handle), 1);
    }
}
