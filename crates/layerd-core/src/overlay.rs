//! Overlayfs-backed snapshotter engine.
//!
//! Layout under the root directory:
//!
//! ```text
//! {root}/metadata.json
//! {root}/snapshots/{id}/fs     # snapshot contents (overlay upperdir)
//! {root}/snapshots/{id}/work   # overlay workdir (active snapshots only)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use containerd_snapshots::tonic::Status;
use containerd_snapshots::{api, Info, Snapshotter, Usage};
use tracing::{debug, info, warn};

use crate::config::{Config, SnapshotterConfig};
use crate::error::{Result, SnapshotError};
use crate::lifecycle::Engine;
use crate::metadata::{Metadata, SnapshotKind, SnapshotRecord};

type Mount = api::types::Mount;

/// Snapshotter that stacks committed layers with overlayfs.
pub struct OverlaySnapshotter {
    root: PathBuf,
    config: SnapshotterConfig,
    metadata: Mutex<Metadata>,
    closed: AtomicBool,
}

impl OverlaySnapshotter {
    /// Open (or initialise) the snapshotter state under `root`.
    pub fn new(root: &Path, config: &Config) -> Result<Self> {
        let snapshots = root.join("snapshots");
        std::fs::create_dir_all(&snapshots)?;

        let mut metadata = Metadata::load(&root.join("metadata.json"))?;

        let missing: Vec<String> = metadata
            .iter()
            .filter(|(_, r)| !snapshots.join(r.id.to_string()).is_dir())
            .map(|(k, _)| k.clone())
            .collect();
        if !missing.is_empty() {
            if !config.snapshotter.allow_invalid_mounts_on_restart {
                return Err(SnapshotError::Metadata(format!(
                    "snapshot directories missing for {}",
                    missing.join(", ")
                )));
            }
            let dropped =
                metadata.retain(|r| snapshots.join(r.id.to_string()).is_dir());
            warn!(dropped = ?dropped, "dropping snapshots with missing directories");
        }

        let snapshotter = Self {
            root: root.to_path_buf(),
            config: config.snapshotter.clone(),
            metadata: Mutex::new(metadata),
            closed: AtomicBool::new(false),
        };
        {
            let meta = snapshotter.lock();
            snapshotter.save(&meta)?;
            snapshotter.cleanup(&meta)?;
            info!(
                root = %root.display(),
                snapshots = meta.len(),
                "overlay snapshotter ready"
            );
        }
        Ok(snapshotter)
    }

    /// Root directory of this snapshotter.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Metadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SnapshotError::Closed);
        }
        Ok(())
    }

    fn save(&self, meta: &Metadata) -> Result<()> {
        meta.save(&self.root.join("metadata.json"))
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.root.join("snapshots").join(id.to_string())
    }

    fn upper_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("fs")
    }

    fn work_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("work")
    }

    /// Apply `change` to a copy of `meta` and persist it; `meta` is only
    /// replaced once the copy is on disk.
    fn commit_change<T>(
        &self,
        meta: &mut Metadata,
        change: impl FnOnce(&mut Metadata) -> Result<T>,
    ) -> Result<T> {
        let mut staged = meta.clone();
        let out = change(&mut staged)?;
        self.save(&staged)?;
        *meta = staged;
        Ok(out)
    }

    /// Remove entries under `snapshots/` no record refers to.
    fn cleanup(&self, meta: &Metadata) -> Result<()> {
        let live: Vec<String> = meta.iter().map(|(_, r)| r.id.to_string()).collect();
        for entry in std::fs::read_dir(self.root.join("snapshots"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            debug!(path = %entry.path().display(), "removing orphaned snapshot entry");
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn create_snapshot(
        &self,
        kind: SnapshotKind,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        self.check_open()?;
        let mut meta = self.lock();
        let mut created_dir = None;
        let staged = self.commit_change(&mut meta, |staged| {
            let id = staged.create(&key, &parent, kind, labels)?.id;
            created_dir = Some(self.snapshot_dir(id));
            std::fs::create_dir_all(self.upper_path(id))?;
            if kind == SnapshotKind::Active {
                std::fs::create_dir_all(self.work_path(id))?;
            }
            Ok(id)
        });
        let id = match staged {
            Ok(id) => id,
            Err(e) => {
                if let Some(dir) = created_dir {
                    let _ = std::fs::remove_dir_all(dir);
                }
                return Err(e);
            }
        };
        debug!(key = %key, parent = %parent, ?kind, id, "snapshot created");
        self.mounts_for(&meta, &key)
    }

    fn mounts_for(&self, meta: &Metadata, key: &str) -> Result<Vec<Mount>> {
        let record = meta.get(key)?;
        let parents = meta.parents(key)?;

        match (record.kind, parents.as_slice()) {
            (SnapshotKind::Committed, _) => Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} is committed and cannot be mounted"
            ))),
            (SnapshotKind::Active, []) => Ok(vec![bind_mount(&self.upper_path(record.id), false)]),
            (SnapshotKind::View, []) => Ok(vec![bind_mount(&self.upper_path(record.id), true)]),
            (SnapshotKind::View, [parent]) => {
                Ok(vec![bind_mount(&self.upper_path(parent.id), true)])
            }
            (kind, parents) => Ok(vec![self.overlay_mount(record, kind, parents)]),
        }
    }

    fn overlay_mount(
        &self,
        record: &SnapshotRecord,
        kind: SnapshotKind,
        parents: &[&SnapshotRecord],
    ) -> Mount {
        let mut options = self.config.overlay_options.clone();
        if kind == SnapshotKind::Active {
            options.push(format!("workdir={}", self.work_path(record.id).display()));
            options.push(format!("upperdir={}", self.upper_path(record.id).display()));
        }
        let lower: Vec<String> = parents
            .iter()
            .map(|p| self.upper_path(p.id).display().to_string())
            .collect();
        options.push(format!("lowerdir={}", lower.join(":")));

        Mount {
            r#type: "overlay".to_string(),
            source: "overlay".to_string(),
            options,
            ..Default::default()
        }
    }
}

fn bind_mount(path: &Path, readonly: bool) -> Mount {
    Mount {
        r#type: "bind".to_string(),
        source: path.display().to_string(),
        options: vec![
            if readonly { "ro" } else { "rw" }.to_string(),
            "rbind".to_string(),
        ],
        ..Default::default()
    }
}

fn disk_usage(path: &Path) -> std::io::Result<Usage> {
    let mut usage = Usage::default();
    let mut pending = vec![path.to_path_buf()];
    usage.inodes = 1;
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            usage.inodes += 1;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                usage.size += i64::try_from(meta.len()).unwrap_or(i64::MAX);
            }
        }
    }
    Ok(usage)
}

#[async_trait]
impl Engine for OverlaySnapshotter {
    fn open(root: &Path, config: &Config) -> Result<Self> {
        Self::new(root, config)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SnapshotError::Closed);
        }
        let meta = self.lock();
        self.save(&meta)?;
        if !self.config.sync_remove {
            self.cleanup(&meta)?;
        }
        info!(root = %self.root.display(), "overlay snapshotter closed");
        Ok(())
    }
}

#[containerd_snapshots::tonic::async_trait]
impl Snapshotter for OverlaySnapshotter {
    type Error = Status;

    async fn stat(&self, key: String) -> std::result::Result<Info, Self::Error> {
        self.check_open()?;
        let meta = self.lock();
        Ok(meta.get(&key)?.to_info(&key))
    }

    async fn update(
        &self,
        info: Info,
        fieldpaths: Option<Vec<String>>,
    ) -> std::result::Result<Info, Self::Error> {
        self.check_open()?;
        let mut meta = self.lock();
        let updated = self.commit_change(&mut meta, |staged| {
            let record = staged.get_mut(&info.name)?;
            match fieldpaths.filter(|paths| !paths.is_empty()) {
                None => record.labels = info.labels.clone(),
                Some(paths) => {
                    for path in paths {
                        if path == "labels" {
                            record.labels = info.labels.clone();
                        } else if let Some(label) = path.strip_prefix("labels.") {
                            match info.labels.get(label) {
                                Some(value) => {
                                    record.labels.insert(label.to_owned(), value.clone());
                                }
                                None => {
                                    record.labels.remove(label);
                                }
                            }
                        } else {
                            return Err(SnapshotError::InvalidArgument(format!(
                                "cannot update field {path:?}"
                            )));
                        }
                    }
                }
            }
            record.updated_at = std::time::SystemTime::now();
            Ok(record.to_info(&info.name))
        })?;
        Ok(updated)
    }

    async fn usage(&self, key: String) -> std::result::Result<Usage, Self::Error> {
        self.check_open()?;
        let id = self.lock().get(&key)?.id;
        let upper = self.upper_path(id);
        let usage = tokio::task::spawn_blocking(move || disk_usage(&upper))
            .await
            .map_err(|e| Status::internal(format!("usage walk failed: {e}")))?
            .map_err(SnapshotError::from)?;
        Ok(usage)
    }

    async fn mounts(&self, key: String) -> std::result::Result<Vec<Mount>, Self::Error> {
        self.check_open()?;
        let meta = self.lock();
        Ok(self.mounts_for(&meta, &key)?)
    }

    async fn prepare(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        Ok(self.create_snapshot(SnapshotKind::Active, key, parent, labels)?)
    }

    async fn view(
        &self,
        key: String,
        parent: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        Ok(self.create_snapshot(SnapshotKind::View, key, parent, labels)?)
    }

    async fn commit(
        &self,
        name: String,
        key: String,
        labels: HashMap<String, String>,
    ) -> std::result::Result<(), Self::Error> {
        self.check_open()?;
        let mut meta = self.lock();
        let id = self.commit_change(&mut meta, |staged| {
            Ok(staged.commit(&name, &key, labels)?.id)
        })?;
        // Committed layers are never mounted writable again.
        let _ = std::fs::remove_dir_all(self.work_path(id));
        debug!(name = %name, key = %key, id, "snapshot committed");
        Ok(())
    }

    async fn remove(&self, key: String) -> std::result::Result<(), Self::Error> {
        self.check_open()?;
        let mut meta = self.lock();
        let record = self.commit_change(&mut meta, |staged| staged.remove(&key))?;
        if self.config.sync_remove {
            std::fs::remove_dir_all(self.snapshot_dir(record.id)).map_err(SnapshotError::from)?;
        }
        debug!(key = %key, id = record.id, "snapshot removed");
        Ok(())
    }

    type InfoStream = futures::stream::Iter<std::vec::IntoIter<std::result::Result<Info, Status>>>;

    async fn list(&self) -> std::result::Result<Self::InfoStream, Self::Error> {
        self.check_open()?;
        let infos: Vec<_> = self
            .lock()
            .iter()
            .map(|(name, record)| Ok(record.to_info(name)))
            .collect();
        Ok(futures::stream::iter(infos))
    }
}
