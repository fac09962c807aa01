//! `layerd-core` — configuration, errors, engine lifecycle and the overlay
//! snapshotter engine.
//!
//! - [`config`] — `config.toml` schema and resolution
//! - [`error`] — [`DaemonError`] bootstrap taxonomy and [`SnapshotError`]
//! - [`lifecycle`] — [`SnapshotterLifecycle`] construct/close
//! - [`overlay`] — [`OverlaySnapshotter`], the containerd snapshotter engine
//! - [`metadata`] — persisted snapshot records

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod overlay;

pub use config::{Config, SnapshotterConfig, DEFAULT_CONFIG_PATH};
pub use error::{DaemonError, Result, SnapshotError, FATAL_TARGET};
pub use lifecycle::{Engine, SnapshotterLifecycle};
pub use metadata::{Metadata, SnapshotKind, SnapshotRecord};
pub use overlay::OverlaySnapshotter;
